// src/core/master/ip.rs

//! External IP discovery: tries a fixed ordered list of HTTP echo services
//! with a short per-provider timeout, first success wins. Failure is
//! non-fatal and leaves the IP at `0.0.0.0` (§4.7).

use std::time::Duration;

use tracing::{debug, warn};

const IP_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered list of plain-text IP echo services, tried in order.
const ECHO_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

/// Tries each echo service in order with a short timeout; the first
/// well-formed IPv4/IPv6 response wins. Returns `"0.0.0.0"` if every
/// provider fails or returns something unparseable, rather than erroring.
pub async fn discover_external_ip(http: &reqwest::Client) -> String {
    for &service in ECHO_SERVICES {
        match http.get(service).timeout(IP_LOOKUP_TIMEOUT).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => {
                    let candidate = body.trim();
                    if candidate.parse::<std::net::IpAddr>().is_ok() {
                        return candidate.to_string();
                    }
                    debug!("ip lookup via {service} returned an unparseable body: {candidate:?}");
                }
                Err(e) => debug!("ip lookup via {service} failed to read body: {e}"),
            },
            Err(e) => debug!("ip lookup via {service} failed: {e}"),
        }
    }
    warn!("external ip discovery exhausted every provider; falling back to 0.0.0.0");
    "0.0.0.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_services_list_is_non_empty() {
        assert!(!ECHO_SERVICES.is_empty());
    }

    #[test]
    fn ip_parsing_accepts_trimmed_ipv4() {
        assert!(" 203.0.113.7 \n".trim().parse::<std::net::IpAddr>().is_ok());
    }
}
