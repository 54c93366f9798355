//! Protocol/API version negotiation.

use std::cmp::Ordering;

use modlink_protocol::compare_versions;
use modlink_protocol::event::{CompatibilityMode, CompatibilityRequest, CompatibilityResult};

use crate::config::HostConfig;

/// `exact` when the peer asks for the host's current versions, otherwise the
/// highest version pair both sides support, otherwise `rejected`.
pub fn negotiate(config: &HostConfig, request: &CompatibilityRequest) -> CompatibilityResult {
    if request.protocol_version == config.protocol_version
        && request.api_version == config.api_version
    {
        return CompatibilityResult {
            protocol_version: config.protocol_version.clone(),
            api_version: config.api_version.clone(),
            mode: CompatibilityMode::Exact,
            reason: None,
        };
    }

    let protocol = highest_common(
        &config.protocol_versions(),
        &request.protocol_version,
        &request.supported_protocol_versions,
    );
    let api = highest_common(
        &config.api_versions(),
        &request.api_version,
        &request.supported_api_versions,
    );

    match (protocol, api) {
        (Some(protocol_version), Some(api_version)) => CompatibilityResult {
            reason: Some(format!(
                "requested protocol {} / api {}, negotiated {protocol_version} / {api_version}",
                request.protocol_version, request.api_version
            )),
            protocol_version,
            api_version,
            mode: CompatibilityMode::Downgraded,
        },
        (protocol, _) => CompatibilityResult {
            protocol_version: config.protocol_version.clone(),
            api_version: config.api_version.clone(),
            mode: CompatibilityMode::Rejected,
            reason: Some(if protocol.is_none() {
                format!(
                    "no common protocol version (host supports {})",
                    config.protocol_versions().join(", ")
                )
            } else {
                format!(
                    "no common api version (host supports {})",
                    config.api_versions().join(", ")
                )
            }),
        },
    }
}

fn highest_common(host: &[&str], requested: &str, supported: &[String]) -> Option<String> {
    let peer = std::iter::once(requested).chain(supported.iter().map(String::as_str));
    peer.filter(|version| host.contains(version))
        .max_by(|a, b| match compare_versions(a, b) {
            Ordering::Equal => a.cmp(b),
            other => other,
        })
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(protocol: &str, api: &str, supported: &[&str]) -> CompatibilityRequest {
        CompatibilityRequest {
            protocol_version: protocol.into(),
            api_version: api.into(),
            supported_protocol_versions: supported.iter().map(|v| v.to_string()).collect(),
            supported_api_versions: vec!["1.0".into()],
        }
    }

    fn host() -> HostConfig {
        HostConfig {
            protocol_version: "2.0".into(),
            supported_protocol_versions: vec!["1.0".into(), "1.5".into()],
            ..HostConfig::default()
        }
    }

    #[test]
    fn exact_match() {
        let result = negotiate(&host(), &request("2.0", "1.0", &[]));
        assert_eq!(result.mode, CompatibilityMode::Exact);
        assert!(result.reason.is_none());
    }

    #[test]
    fn downgrades_to_highest_common_version() {
        let result = negotiate(&host(), &request("3.0", "1.0", &["1.0", "1.5"]));
        assert_eq!(result.mode, CompatibilityMode::Downgraded);
        assert_eq!(result.protocol_version, "1.5");
        assert_eq!(result.api_version, "1.0");
    }

    #[test]
    fn rejects_without_overlap() {
        let result = negotiate(&host(), &request("0.9", "1.0", &["0.8"]));
        assert_eq!(result.mode, CompatibilityMode::Rejected);
        assert!(result.reason.unwrap().contains("protocol"));
    }
}
