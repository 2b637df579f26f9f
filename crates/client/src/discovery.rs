//! Endpoint discovery
//!
//! The active configuration is copied into a small owned model first, so
//! the selection rules can be exercised without a device.

use crate::error::DiscoveryError;
use protocol::{PipeIndex, is_in_address};

type Result<T> = std::result::Result<T, DiscoveryError>;

/// One endpoint of an alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLayout {
    pub address: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltSettingLayout {
    pub interface_number: u8,
    pub endpoints: Vec<EndpointLayout>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub alt_settings: Vec<AltSettingLayout>,
}

/// Owned view of a configuration descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayout {
    pub interfaces: Vec<InterfaceLayout>,
}

impl From<&rusb::ConfigDescriptor> for ConfigLayout {
    fn from(config: &rusb::ConfigDescriptor) -> Self {
        let interfaces = config
            .interfaces()
            .map(|interface| InterfaceLayout {
                alt_settings: interface
                    .descriptors()
                    .map(|alt| AltSettingLayout {
                        interface_number: alt.interface_number(),
                        endpoints: alt
                            .endpoint_descriptors()
                            .map(|ep| EndpointLayout {
                                address: ep.address(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Self { interfaces }
    }
}

/// Bulk endpoint pair the transfer engine streams over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub interface: u8,
    /// Device-to-host address (direction bit set)
    pub inbound: u8,
    /// Host-to-device address
    pub outbound: u8,
}

fn mismatch(reason: impl Into<String>) -> DiscoveryError {
    DiscoveryError::ProtocolMismatch(reason.into())
}

/// First alternate setting of the only interface, with at least two endpoints
fn primary_setting(layout: &ConfigLayout) -> Result<&AltSettingLayout> {
    let [interface] = layout.interfaces.as_slice() else {
        return Err(mismatch(format!(
            "expected exactly one interface, found {}",
            layout.interfaces.len()
        )));
    };

    let setting = interface
        .alt_settings
        .first()
        .ok_or_else(|| mismatch("interface has no alternate setting"))?;

    if setting.endpoints.len() < 2 {
        return Err(mismatch(format!(
            "expected at least 2 endpoints, found {}",
            setting.endpoints.len()
        )));
    }

    Ok(setting)
}

/// Pick the first IN and the first OUT endpoint in descriptor order
pub fn discover(layout: &ConfigLayout) -> Result<BulkEndpoints> {
    let setting = primary_setting(layout)?;

    let mut inbound = None;
    let mut outbound = None;
    for ep in &setting.endpoints {
        if is_in_address(ep.address) {
            inbound.get_or_insert(ep.address);
        } else {
            outbound.get_or_insert(ep.address);
        }
    }

    let inbound = inbound.ok_or_else(|| mismatch("no device-to-host endpoint"))?;
    let outbound = outbound.ok_or_else(|| mismatch("no host-to-device endpoint"))?;
    if inbound == outbound {
        return Err(mismatch(format!(
            "inbound and outbound share address {:#04x}",
            inbound
        )));
    }

    Ok(BulkEndpoints {
        interface: setting.interface_number,
        inbound,
        outbound,
    })
}

/// Endpoints of a specific pipe, checked against the configuration
pub fn pipe_endpoints(layout: &ConfigLayout, pipe: PipeIndex) -> Result<BulkEndpoints> {
    let setting = primary_setting(layout)?;
    let has = |address: u8| setting.endpoints.iter().any(|ep| ep.address == address);

    for address in [pipe.in_address(), pipe.out_address()] {
        if !has(address) {
            return Err(mismatch(format!(
                "{} endpoint {:#04x} not in active configuration",
                pipe, address
            )));
        }
    }

    Ok(BulkEndpoints {
        interface: setting.interface_number,
        inbound: pipe.in_address(),
        outbound: pipe.out_address(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(addresses: &[u8]) -> ConfigLayout {
        ConfigLayout {
            interfaces: vec![InterfaceLayout {
                alt_settings: vec![AltSettingLayout {
                    interface_number: 0,
                    endpoints: addresses
                        .iter()
                        .map(|&address| EndpointLayout { address })
                        .collect(),
                }],
            }],
        }
    }

    #[test]
    fn test_discover_single_pair() {
        let eps = discover(&layout(&[0x81, 0x02])).unwrap();
        assert_eq!(eps.inbound, 0x81);
        assert_eq!(eps.outbound, 0x02);
        assert_ne!(eps.inbound, eps.outbound);
    }

    #[test]
    fn test_discover_takes_first_of_each_direction() {
        let eps = discover(&layout(&[0x02, 0x81, 0x04, 0x83, 0x85, 0x06])).unwrap();
        assert_eq!(eps.inbound, 0x81);
        assert_eq!(eps.outbound, 0x02);
    }

    #[test]
    fn test_too_few_endpoints() {
        assert!(matches!(
            discover(&layout(&[0x81])),
            Err(DiscoveryError::ProtocolMismatch(_))
        ));
        assert!(discover(&layout(&[])).is_err());
    }

    #[test]
    fn test_missing_direction() {
        let err = discover(&layout(&[0x81, 0x83])).unwrap_err();
        assert_eq!(
            err,
            DiscoveryError::ProtocolMismatch("no host-to-device endpoint".to_string())
        );
        assert!(discover(&layout(&[0x02, 0x04])).is_err());
    }

    #[test]
    fn test_interface_count() {
        assert!(discover(&ConfigLayout::default()).is_err());

        let mut two = layout(&[0x81, 0x02]);
        two.interfaces.push(two.interfaces[0].clone());
        assert!(discover(&two).is_err());
    }

    #[test]
    fn test_no_alt_setting() {
        let config = ConfigLayout {
            interfaces: vec![InterfaceLayout::default()],
        };
        assert!(discover(&config).is_err());
    }

    #[test]
    fn test_pipe_endpoints() {
        let config = layout(&[0x81, 0x02, 0x83, 0x04, 0x85, 0x06]);

        let eps = pipe_endpoints(&config, PipeIndex::new(2).unwrap()).unwrap();
        assert_eq!((eps.inbound, eps.outbound), (0x85, 0x06));

        let short = layout(&[0x81, 0x02]);
        assert!(pipe_endpoints(&short, PipeIndex::new(1).unwrap()).is_err());
    }
}
