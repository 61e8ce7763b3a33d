//! mDNS service discovery for Tapro terminals.
//!
//! Terminals advertise under the `_taplink._tcp` service type. The browse
//! machinery sits behind [`ServiceBrowser`] so the connection logic can be
//! exercised against a scripted browser without multicast traffic.

use std::collections::HashMap;

use taplink_types::error::{TapError, error_codes};
use tokio::sync::mpsc;

/// The DNS-SD service type of Tapro terminals.
pub const SERVICE_TYPE: &str = "_taplink._tcp.local.";

/// A terminal advertisement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    /// The instance name, e.g. `TaproService_D-7`.
    pub name: String,
    /// The advertised service type.
    pub service_type: String,
    /// Resolved host address.
    pub host: String,
    /// Advertised port.
    pub port: u16,
    /// TXT attributes.
    pub attributes: HashMap<String, String>,
}

impl ServiceInfo {
    /// An advertisement is usable iff it resolved to a dialable endpoint.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port > 0
    }
}

/// A raw browse event.
///
/// Resolution dedup (found vs. updated vs. unchanged) happens in the
/// monitor; the browser reports what the wire said.
#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    /// An advertisement resolved to an endpoint.
    Resolved(ServiceInfo),
    /// An advertisement disappeared.
    Removed {
        /// The instance name that went away.
        name: String,
    },
}

/// Source of mDNS browse events.
///
/// Every call to [`browse`] opens an independent browse session; dropping
/// the receiver ends it.
///
/// [`browse`]: ServiceBrowser::browse
pub trait ServiceBrowser: Send + Sync {
    /// Starts browsing for terminal advertisements.
    fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TapError>;
}

/// [`ServiceBrowser`] backed by the system's multicast interfaces.
#[derive(Default)]
pub struct MdnsBrowser;

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self) -> Result<mpsc::Receiver<DiscoveryEvent>, TapError> {
        let daemon = mdns_sd::ServiceDaemon::new().map_err(|err| {
            TapError::with_message(
                error_codes::SERVICE_EXCEPTION,
                format!("cannot start mDNS daemon: {err}"),
            )
        })?;
        let browse = daemon.browse(SERVICE_TYPE).map_err(|err| {
            TapError::with_message(
                error_codes::SERVICE_EXCEPTION,
                format!("cannot browse {SERVICE_TYPE}: {err}"),
            )
        })?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Ok(event) = browse.recv_async().await {
                let mapped = match event {
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        Some(DiscoveryEvent::Resolved(convert(&info)))
                    }
                    mdns_sd::ServiceEvent::ServiceRemoved(_, fullname) => {
                        Some(DiscoveryEvent::Removed {
                            name: instance_name(&fullname),
                        })
                    }
                    _ => None,
                };
                if let Some(mapped) = mapped
                    && tx.send(mapped).await.is_err()
                {
                    // receiver gone, browse session over
                    break;
                }
            }
            let _ = daemon.shutdown();
        });
        Ok(rx)
    }
}

fn convert(info: &mdns_sd::ServiceInfo) -> ServiceInfo {
    let host = info
        .get_addresses()
        .iter()
        .next()
        .map(ToString::to_string)
        .unwrap_or_else(|| info.get_hostname().trim_end_matches('.').to_string());
    ServiceInfo {
        name: instance_name(info.get_fullname()),
        service_type: SERVICE_TYPE.to_string(),
        host,
        port: info.get_port(),
        attributes: info
            .get_properties()
            .iter()
            .map(|property| (property.key().to_string(), property.val_str().to_string()))
            .collect(),
    }
}

/// Strips the service-type suffix off a DNS-SD fullname.
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{SERVICE_TYPE}"))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_requires_host_and_port() {
        let mut info = ServiceInfo {
            name: "TaproService_D-7".to_string(),
            service_type: SERVICE_TYPE.to_string(),
            host: "10.0.0.42".to_string(),
            port: 8443,
            attributes: HashMap::new(),
        };
        assert!(info.is_valid());
        info.host.clear();
        assert!(!info.is_valid());
        info.host = "10.0.0.42".to_string();
        info.port = 0;
        assert!(!info.is_valid());
    }

    #[test]
    fn strips_service_type_suffix() {
        assert_eq!(
            instance_name("TaproService_D-7._taplink._tcp.local."),
            "TaproService_D-7"
        );
        assert_eq!(instance_name("plain-name"), "plain-name");
    }
}
