//! Connection descriptors and parsing of the server's device reply.

use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{DeviceType, NodeId};

const CONNECTION_TYPE_SSH: u16 = 100;
const CONNECTION_TYPE_TELNET: u16 = 101;
const CONNECTION_TYPE_SERIAL: u16 = 102;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport used to reach a device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransportKind {
    /// System `ssh` client.
    Ssh,
    /// Raw Telnet over TCP.
    Telnet,
    /// Local serial tty.
    Serial,
    /// Commands run in a chroot on the local host.
    LocalChroot,
}

/// Serial parity setting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl Parity {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().chars().next() {
            Some('e') => Self::Even,
            Some('o') => Self::Odd,
            _ => Self::None,
        }
    }
}

/// Line settings for serial descriptors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerialSettings {
    /// Device path, for example `/dev/ttyUSB0`.
    pub port_name: Utf8PathBuf,
    /// Line speed.
    pub baud_rate: u32,
    /// Parity bit.
    pub parity: Parity,
    /// Data bits per character (5–8).
    pub data_bits: u8,
    /// Stop bits (1 or 2).
    pub stop_bits: u8,
    /// Hardware (RTS/CTS) flow control.
    pub rts_cts: bool,
    /// Software (XON/XOFF) flow control.
    pub xon_xoff: bool,
    /// Sequence appended to each command.
    pub termination: String,
}

/// Intermediate host through which a device is reached.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JumpHost {
    /// Public address of the jump host.
    pub host: String,
    /// Address of the jump host on the device network, when it differs.
    pub private_host: Option<String>,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: Option<String>,
    /// Private key as a path or inline PEM.
    pub private_key: Option<String>,
    /// Shell prompt on the jump host.
    pub prompt: Option<String>,
    /// Local forwarding ports to try, in order.
    pub available_ports: Vec<u16>,
}

/// How to reach one device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionDescriptor {
    /// Transport to use.
    pub kind: TransportKind,
    /// Address or hostname.
    pub host: String,
    /// TCP port; unused for serial and local descriptors.
    pub port: u16,
    /// Login user.
    pub user: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Private key as a path or inline PEM.
    pub private_key: Option<String>,
    /// Shell prompt marking the end of command output.
    pub prompt: Option<String>,
    /// Default timeout for reads on this connection.
    pub read_timeout: Duration,
    /// Optional jump host.
    pub jump_host: Option<JumpHost>,
    /// Serial line settings for serial descriptors.
    pub serial: Option<SerialSettings>,
    /// Root directory for local chroot descriptors.
    pub chroot: Option<Utf8PathBuf>,
}

impl ConnectionDescriptor {
    /// Builds an SSH descriptor with defaults for everything else.
    pub fn ssh(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Ssh,
            host: host.into(),
            port: 22,
            user: Some(user.into()),
            password: None,
            private_key: None,
            prompt: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            jump_host: None,
            serial: None,
            chroot: None,
        }
    }

    /// Builds a local chroot descriptor rooted at `root`.
    pub fn local(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            kind: TransportKind::LocalChroot,
            host: String::from("localhost"),
            port: 0,
            user: None,
            password: None,
            private_key: None,
            prompt: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            jump_host: None,
            serial: None,
            chroot: Some(root.into()),
        }
    }
}

/// Errors raised while parsing the device reply.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The reply did not have the expected shape.
    #[error("malformed device reply: {0}")]
    Malformed(String),
    /// A connection entry used an unknown transport code.
    #[error("node {node_id}: unknown connection type {code}")]
    UnknownConnectionType {
        /// Node the entry belongs to.
        node_id: NodeId,
        /// Transport code found in the reply.
        code: u16,
    },
    /// A connection entry lacked a mandatory field.
    #[error("node {node_id}: connection is missing {field}")]
    MissingField {
        /// Node the entry belongs to.
        node_id: NodeId,
        /// Field that was absent.
        field: &'static str,
    },
}

/// One device record as returned by the server.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    /// Node id.
    pub node_id: NodeId,
    /// Device name.
    pub name: String,
    /// Parsed category.
    pub device_type: DeviceType,
    /// Raw type name as reported.
    pub device_sub_type: String,
    /// Parsed descriptors, in server order.
    pub descriptors: Vec<ConnectionDescriptor>,
    /// Raw server record.
    pub metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawDevice {
    node_number: NodeId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    device_type_data: RawDeviceType,
    #[serde(default)]
    connections: Vec<RawConnection>,
}

#[derive(Default, Deserialize)]
struct RawDeviceType {
    #[serde(default)]
    device_type_name: String,
    #[serde(default)]
    device_class_name: String,
}

#[derive(Deserialize)]
struct RawConnection {
    connection_type: u16,
    ip_address: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    prompt: Option<String>,
    timeout: Option<u64>,
    private_key: Option<String>,
    jump_host: Option<RawJumpHost>,
    chroot: Option<String>,
    port_name: Option<String>,
    baud_rate: Option<u32>,
    parity: Option<String>,
    data_bits: Option<u8>,
    stop_bits: Option<u8>,
    request_to_send: Option<bool>,
    transmit_on: Option<bool>,
    termination_character: Option<String>,
}

#[derive(Deserialize)]
struct RawJumpHost {
    ip_address: String,
    private_ip_address: Option<String>,
    #[serde(default)]
    username: String,
    password: Option<String>,
    private_key: Option<String>,
    prompt: Option<String>,
    available_ports: Option<Value>,
}

/// Parses the `data` array of the device-details reply into records.
///
/// # Errors
///
/// Returns [`DescriptorError`] when the reply is not an array of device
/// records or a connection entry cannot be interpreted.
pub fn parse_device_reply(data: &Value) -> Result<Vec<DeviceRecord>, DescriptorError> {
    let Value::Array(entries) = data else {
        return Err(DescriptorError::Malformed(String::from(
            "expected an array of devices",
        )));
    };

    entries.iter().map(parse_device).collect()
}

fn parse_device(entry: &Value) -> Result<DeviceRecord, DescriptorError> {
    let raw: RawDevice = serde_json::from_value(entry.clone())
        .map_err(|err| DescriptorError::Malformed(err.to_string()))?;
    let metadata = match entry {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    let descriptors = raw
        .connections
        .into_iter()
        .map(|conn| parse_connection(raw.node_number, conn))
        .collect::<Result<Vec<_>, _>>()?;

    let type_name = if raw.device_type_data.device_type_name.is_empty() {
        raw.device_type_data.device_class_name
    } else {
        raw.device_type_data.device_type_name
    };

    Ok(DeviceRecord {
        node_id: raw.node_number,
        name: raw.name,
        device_type: DeviceType::from_type_name(&type_name),
        device_sub_type: type_name,
        descriptors,
        metadata,
    })
}

fn parse_connection(
    node_id: NodeId,
    raw: RawConnection,
) -> Result<ConnectionDescriptor, DescriptorError> {
    let read_timeout = raw
        .timeout
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_READ_TIMEOUT, Duration::from_secs);
    let jump_host = raw.jump_host.map(parse_jump_host);
    let host = raw.ip_address.or(raw.host).unwrap_or_default();

    let kind = match raw.connection_type {
        CONNECTION_TYPE_SSH if raw.chroot.is_some() => TransportKind::LocalChroot,
        CONNECTION_TYPE_SSH => TransportKind::Ssh,
        CONNECTION_TYPE_TELNET => TransportKind::Telnet,
        CONNECTION_TYPE_SERIAL => TransportKind::Serial,
        code => return Err(DescriptorError::UnknownConnectionType { node_id, code }),
    };

    let serial = if kind == TransportKind::Serial {
        let port_name = raw.port_name.ok_or(DescriptorError::MissingField {
            node_id,
            field: "port_name",
        })?;
        Some(SerialSettings {
            port_name: Utf8PathBuf::from(port_name),
            baud_rate: raw.baud_rate.unwrap_or(115_200),
            parity: raw.parity.as_deref().map(Parity::parse).unwrap_or_default(),
            data_bits: raw.data_bits.unwrap_or(8),
            stop_bits: raw.stop_bits.unwrap_or(1),
            rts_cts: raw.request_to_send.unwrap_or(false),
            xon_xoff: raw.transmit_on.unwrap_or(false),
            termination: raw
                .termination_character
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| String::from("\r\n")),
        })
    } else {
        None
    };

    if matches!(kind, TransportKind::Ssh | TransportKind::Telnet) && host.is_empty() {
        return Err(DescriptorError::MissingField {
            node_id,
            field: "ip_address",
        });
    }

    let default_port = match kind {
        TransportKind::Telnet => 23,
        TransportKind::Ssh => 22,
        TransportKind::Serial | TransportKind::LocalChroot => 0,
    };

    Ok(ConnectionDescriptor {
        kind,
        host,
        port: raw.port.unwrap_or(default_port),
        user: raw.username.filter(|u| !u.is_empty()),
        password: raw.password.filter(|p| !p.is_empty()),
        private_key: raw.private_key.filter(|k| !k.is_empty()),
        prompt: raw.prompt.filter(|p| !p.is_empty()),
        read_timeout,
        jump_host,
        serial,
        chroot: raw.chroot.map(Utf8PathBuf::from),
    })
}

fn parse_jump_host(raw: RawJumpHost) -> JumpHost {
    JumpHost {
        host: raw.ip_address,
        private_host: raw.private_ip_address.filter(|h| !h.is_empty()),
        user: raw.username,
        password: raw.password.filter(|p| !p.is_empty()),
        private_key: raw.private_key.filter(|k| !k.is_empty()),
        prompt: raw.prompt.filter(|p| !p.is_empty()),
        available_ports: raw
            .available_ports
            .as_ref()
            .map(parse_ports)
            .unwrap_or_default(),
    }
}

fn parse_ports(value: &Value) -> Vec<u16> {
    match value {
        Value::String(list) => list
            .split(',')
            .filter_map(|port| port.trim().parse().ok())
            .collect(),
        Value::Number(number) => number
            .as_u64()
            .and_then(|port| u16::try_from(port).ok())
            .into_iter()
            .collect(),
        Value::Array(items) => items.iter().flat_map(parse_ports).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ssh_device_with_jump_host() {
        let reply = json!([{
            "node_number": 3,
            "name": "dn-3",
            "device_type_data": {"device_type_name": "terragraph", "device_class_name": "TG"},
            "connections": [{
                "connection_type": 100,
                "ip_address": "fd00::3",
                "port": 22,
                "username": "root",
                "password": "secret",
                "timeout": 30,
                "jump_host": {
                    "ip_address": "10.0.0.1",
                    "username": "jump",
                    "available_ports": "2201, 2202,x"
                }
            }]
        }]);

        let records = parse_device_reply(&reply).expect("reply parses");
        let record = records.first().expect("one record");
        assert_eq!(record.node_id, 3);
        assert_eq!(record.device_type, DeviceType::RadioNode);
        assert_eq!(record.device_sub_type, "terragraph");
        let descriptor = record.descriptors.first().expect("one descriptor");
        assert_eq!(descriptor.kind, TransportKind::Ssh);
        assert_eq!(descriptor.read_timeout, Duration::from_secs(30));
        let jump = descriptor.jump_host.as_ref().expect("jump host");
        assert_eq!(jump.available_ports, vec![2201, 2202]);
        assert!(record.metadata.contains_key("connections"));
    }

    #[test]
    fn parses_serial_settings_with_defaults() {
        let reply = json!([{
            "node_number": 1,
            "device_type_data": {"device_type_name": "attenuator"},
            "connections": [{
                "connection_type": 102,
                "port_name": "/dev/ttyUSB0",
                "parity": "Even",
                "stop_bits": 2
            }]
        }]);

        let records = parse_device_reply(&reply).expect("reply parses");
        let serial = records
            .first()
            .and_then(|r| r.descriptors.first())
            .and_then(|d| d.serial.clone())
            .expect("serial settings");
        assert_eq!(serial.baud_rate, 115_200);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, 2);
        assert_eq!(serial.termination, "\r\n");
    }

    #[test]
    fn rejects_unknown_connection_type() {
        let reply = json!([{
            "node_number": 9,
            "connections": [{"connection_type": 7, "ip_address": "h"}]
        }]);

        let err = parse_device_reply(&reply).expect_err("unknown transport");
        assert!(matches!(
            err,
            DescriptorError::UnknownConnectionType { node_id: 9, code: 7 }
        ));
    }

    #[test]
    fn chroot_field_selects_local_transport() {
        let reply = json!([{
            "node_number": 2,
            "connections": [{"connection_type": 100, "chroot": "/srv/ctrl"}]
        }]);

        let records = parse_device_reply(&reply).expect("reply parses");
        let descriptor = records
            .first()
            .and_then(|r| r.descriptors.first())
            .expect("descriptor");
        assert_eq!(descriptor.kind, TransportKind::LocalChroot);
    }
}
