//! Devices of a test setup and the command channels used to reach them.
//!
//! A [`Device`] is identified by the integer node id assigned by the
//! reservation server. It owns one [`DeviceConnection`], which is opened
//! lazily on the first command and held until teardown.

mod connection;
mod descriptor;
mod factory;
mod jump;
mod local;
mod secret;
mod serial;
mod ssh;
mod stream;
mod telnet;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};

pub use connection::{
    CommandCallbacks, CommandOutcome, CommandReply, ConnectionError, ConnectionFuture,
    DeviceConnection, FailureClass, OutputEvent, ParallelOptions, RC_CANCEL, RC_EXCEPTION,
    RC_TIMEOUT, ReplyFuture, TextCallback,
};
pub use descriptor::{
    ConnectionDescriptor, DescriptorError, DeviceRecord, JumpHost, Parity, SerialSettings,
    TransportKind, parse_device_reply,
};
pub use factory::{ConnectionFactory, SshSettings, TransportFactory};
pub use jump::{PortLease, PortPool};
pub use local::LocalConnection;
pub use serial::SerialConnection;
pub use ssh::SshConnection;
pub use stream::{ChunkFilter, PRE_READ_DELAY, PromptStream, ReadFailure, decode_lossy_ascii};
pub use telnet::TelnetConnection;

/// Integer identifier assigned to a device by the reservation server.
pub type NodeId = u32;

/// Device category reported by the reservation server.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DeviceType {
    /// Anything without a more specific category.
    Generic,
    /// Programmable RF attenuator.
    Attenuator,
    /// Bench power supply.
    PowerSupply,
    /// Signal generator.
    SignalGen,
    /// Spectrum analyzer.
    SpectrumAnalyzer,
    /// Radio access network element.
    Ran,
    /// RF or network switch.
    Switch,
    /// Radio node under test; receives the composed node config.
    RadioNode,
    /// UE emulator.
    UeEmulator,
    /// Traffic generator.
    TrafficGen,
    /// Host running the network controller.
    ControllerHost,
}

impl DeviceType {
    /// Every known device type, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::Generic,
        Self::Attenuator,
        Self::PowerSupply,
        Self::SignalGen,
        Self::SpectrumAnalyzer,
        Self::Ran,
        Self::Switch,
        Self::RadioNode,
        Self::UeEmulator,
        Self::TrafficGen,
        Self::ControllerHost,
    ];

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Attenuator => "attenuator",
            Self::PowerSupply => "power-supply",
            Self::SignalGen => "signal-gen",
            Self::SpectrumAnalyzer => "spectrum-an",
            Self::Ran => "ran",
            Self::Switch => "switch",
            Self::RadioNode => "radio-node",
            Self::UeEmulator => "ue-emulator",
            Self::TrafficGen => "traffic-gen",
            Self::ControllerHost => "controller-host",
        }
    }

    /// Maps a server-side type name onto a category. Unknown names fall
    /// back to [`DeviceType::Generic`].
    #[must_use]
    pub fn from_type_name(name: &str) -> Self {
        let normalised: String = name
            .trim()
            .chars()
            .map(|ch| match ch {
                '_' | ' ' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        match normalised.as_str() {
            "attenuator" => Self::Attenuator,
            "power-supply" | "powersupply" => Self::PowerSupply,
            "signal-gen" | "signal-generator" => Self::SignalGen,
            "spectrum-an" | "spectrum-analyzer" => Self::SpectrumAnalyzer,
            "ran" => Self::Ran,
            "switch" | "rf-switch" => Self::Switch,
            "radio-node" | "terragraph" | "puma" => Self::RadioNode,
            "ue-emulator" => Self::UeEmulator,
            "traffic-gen" | "traffic-generator" => Self::TrafficGen,
            "controller-host" | "controller" | "x86" => Self::ControllerHost,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_type_name(s))
    }
}

/// A reserved device and its command channel.
#[derive(Clone, Debug)]
pub struct Device {
    /// Identifier assigned by the reservation server.
    pub node_id: NodeId,
    /// Human-readable device name.
    pub name: String,
    /// Category used for fanout targeting and log collection.
    pub device_type: DeviceType,
    /// Free-form subtype, for example `accton dn`.
    pub device_sub_type: String,
    /// Connection descriptors in server order; the first one is used.
    pub descriptors: Vec<ConnectionDescriptor>,
    /// Raw server record for the device.
    pub metadata: Map<String, Value>,
    /// Command channel built from the first descriptor.
    pub connection: Arc<dyn DeviceConnection>,
}

impl Device {
    /// Address shown to operators, taken from the primary descriptor.
    #[must_use]
    pub fn address(&self) -> String {
        self.descriptors
            .first()
            .map_or_else(|| self.connection.describe(), |d| d.host.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("terragraph", DeviceType::RadioNode)]
    #[case("Radio Node", DeviceType::RadioNode)]
    #[case("power_supply", DeviceType::PowerSupply)]
    #[case("spectrum-analyzer", DeviceType::SpectrumAnalyzer)]
    #[case("toaster", DeviceType::Generic)]
    fn type_names_map_onto_categories(#[case] name: &str, #[case] expected: DeviceType) {
        assert_eq!(DeviceType::from_type_name(name), expected);
    }

    #[test]
    fn canonical_names_round_trip() {
        for kind in DeviceType::ALL {
            assert_eq!(DeviceType::from_type_name(kind.as_str()), kind);
        }
    }
}
