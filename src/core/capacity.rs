// src/core/capacity.rs

//! CPU-topology-based maximum instance count (C2). A pure function; every
//! scaling operation in [`crate::core::scaling`] defers to it rather than
//! re-deriving the reserved-core brackets itself (§9 open question: the
//! source was inconsistent about which bracket `cpu_count == 4` belongs to;
//! this is the single normalised definition).

/// Cores withheld from the per-core allocation for the OS/manager itself,
/// based on how many cores the host has (§4.2).
fn reserved_cores(cpu_count: usize) -> usize {
    match cpu_count {
        0..=4 => 1,
        5..=12 => 2,
        _ => 4,
    }
}

/// `max_allowed = floor(per_core_factor * cpu_count) - reserved(cpu_count)`,
/// clamped to `>= 0`.
pub fn max_allowed_servers(cpu_count: usize, per_core_factor: f64) -> usize {
    let raw = (per_core_factor * cpu_count as f64).floor();
    let raw = if raw.is_sign_negative() || !raw.is_finite() {
        0
    } else {
        raw as usize
    };
    raw.saturating_sub(reserved_cores(cpu_count))
}

/// Reads the logical CPU count of the host via `sysinfo`, matching this
/// codebase's existing CPU-topology probing for resource-aware subsystems.
pub fn detect_cpu_count() -> usize {
    let system = sysinfo::System::new_all();
    system.cpus().len().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_table_matches_spec() {
        // cpu_count, per_core_factor -> expected max_allowed
        let cases: &[(usize, f64, usize)] = &[
            (1, 0.5, 0),
            (1, 1.0, 0),
            (1, 2.0, 1),
            (4, 0.5, 1),
            (4, 1.0, 3),
            (4, 2.0, 7),
            (5, 0.5, 0),
            (5, 1.0, 3),
            (5, 2.0, 8),
            (12, 0.5, 4),
            (12, 1.0, 10),
            (12, 2.0, 22),
            (13, 0.5, 2),
            (13, 1.0, 9),
            (13, 2.0, 22),
            (64, 0.5, 28),
            (64, 1.0, 60),
            (64, 2.0, 124),
        ];
        for &(cpus, factor, expected) in cases {
            assert_eq!(
                max_allowed_servers(cpus, factor),
                expected,
                "cpu_count={cpus} per_core_factor={factor}"
            );
        }
    }

    #[test]
    fn never_goes_negative_on_a_starved_host() {
        assert_eq!(max_allowed_servers(1, 0.1), 0);
    }

    #[test]
    fn reserved_bracket_is_inclusive_at_four_and_twelve() {
        assert_eq!(reserved_cores(4), 1);
        assert_eq!(reserved_cores(5), 2);
        assert_eq!(reserved_cores(12), 2);
        assert_eq!(reserved_cores(13), 4);
    }
}
