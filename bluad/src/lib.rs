//! # bluad — Bluetooth audio bridge daemon
//!
//! This crate exposes the Bluetooth audio profiles (A2DP streaming and
//! HSP/HFP telephony) of connected remote devices as locally accessible PCM
//! endpoints, and moves PCM samples between those endpoints and Bluetooth
//! transport sockets in real time, performing codec work along the way.
//!
//! The daemon publishes its object tree on the D-Bus system bus:
//!
//! * a [Manager](bus) object at `/org/bluad` with the `GetPCMs` method and
//!   the `PCMAdded` / `PCMRemoved` signals,
//! * one PCM object per transport at `/org/bluad/hciX/dev_../<profile>`
//!   with an `Open` method that hands two file descriptors to the client:
//!   a PCM FIFO and a SEQPACKET control channel.
//!
//! Internally one asynchronous I/O task runs per transport. It multiplexes
//! the transport signal queue, the Bluetooth socket and the PCM FIFO in a
//! single readiness wait, encodes or decodes audio and paces the stream at
//! the nominal sample rate. See the [io] and [transport] modules.
//!
//! This crate depends on the [tokio] asynchronous runtime and requires a
//! running D-Bus daemon; the Bluetooth host stack is consumed through its
//! D-Bus media transport interface.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("bluad only supports the Linux operating system.");

use dbus::{
    arg::{prop_cast, AppendAll, PropMap, RefArg, Variant},
    nonblock::{stdintf::org_freedesktop_dbus::ObjectManager, Proxy, SyncConnection},
    Path,
};
use dbus_crossroads::Crossroads;
use futures::Future;
use std::{
    collections::HashMap,
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    ops::{Deref, DerefMut},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use strum::EnumString;
use tokio::task::JoinError;

use macaddr::MacAddr6;

/// D-Bus name under which the daemon registers itself.
pub const SERVICE_NAME: &str = "org.bluad";
/// D-Bus path of the manager object.
pub const MANAGER_PATH: &str = "/org/bluad";
/// Prefix of D-Bus error names returned by the daemon.
pub const ERR_PREFIX: &str = "org.bluad.Error.";

pub(crate) const BLUEZ_SERVICE: &str = "org.bluez";
pub(crate) const TIMEOUT: Duration = Duration::from_secs(30);

macro_rules! cr_property {
    ($ib:expr, $dbus_name:expr, $obj:ident => $get:block) => {
        $ib.property($dbus_name).get(|ctx, $obj| {
            let value = $get;
            log::trace!("{}: {}.{} = {:?}", ctx.path(), ctx.interface(), &$dbus_name, &value);
            match value {
                Some(v) => Ok(v),
                None => Err(dbus_crossroads::MethodErr::no_property($dbus_name)),
            }
        })
    };
}

pub(crate) use cr_property;

mod sock;

mod adapter;
pub mod asrsync;
mod bluez;
pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
mod device;
pub mod ffb;
pub mod io;
mod pcm;
pub mod rtp;
mod session;
#[cfg(test)]
pub(crate) mod test_util;
pub mod transport;
pub mod volume;

pub use crate::{adapter::Adapter, device::Device, pcm::*, session::*};

/// Daemon error.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Daemon error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// endpoint is busy
    Busy,
    /// operation mode not supported by the transport
    NotSupported,
    /// transport is not connected
    NotConnected,
    /// Bluetooth transport could not be acquired
    Acquire,
    /// operation failed
    Failed,
    /// invalid arguments
    InvalidArguments,
    /// the target object was either not present or removed
    #[strum(disabled)]
    NotFound,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// invalid Bluetooth adapter name: {0}
    #[strum(disabled)]
    InvalidName(String),
    /// audio codec failed: {0}
    #[strum(disabled)]
    Codec(String),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal daemon error kind.
///
/// This is most likely caused by an incompatibility between this daemon and
/// the Bluetooth host stack it talks to.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid value
    InvalidValue,
    /// key {0} is missing
    MissingKey(String),
    /// join error
    JoinError,
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("DBus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        if err.name() == Some("org.freedesktop.DBus.Error.UnknownObject") {
            return Self::new(ErrorKind::NotFound);
        }
        let kind = match err
            .name()
            .and_then(|name| name.strip_prefix(ERR_PREFIX))
            .and_then(|s| ErrorKind::from_str(s).ok())
        {
            Some(kind) => kind,
            _ => ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
        };
        Self { kind, message: err.message().unwrap_or_default().to_string() }
    }
}

impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        let name: &str = match &err.kind {
            ErrorKind::Busy => "Busy",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::Acquire => "Acquire",
            ErrorKind::InvalidArguments => "InvalidArguments",
            _ => "Failed",
        };
        Self::from((ERR_PREFIX.to_string() + name, &err.to_string()))
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<strum::ParseError> for Error {
    fn from(_: strum::ParseError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::InvalidValue), message: String::new() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

/// Daemon result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth device address.
///
/// The string representation is in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// The address formatted as a D-Bus path component, e.g. `dev_00_11_22_33_44_55`.
    pub fn to_path_component(self) -> String {
        format!(
            "dev_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }

    /// Parses a D-Bus path component of the form `dev_00_11_22_33_44_55`.
    pub fn parse_path_component(s: &str) -> Option<Self> {
        let s = s.strip_prefix("dev_")?;
        s.replace('_', ":").parse().ok()
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Gets all D-Bus objects from the Bluetooth host stack.
pub(crate) async fn all_bluez_objects(
    connection: &SyncConnection,
) -> Result<HashMap<Path<'static>, HashMap<String, PropMap>>> {
    let p = Proxy::new(BLUEZ_SERVICE, "/", TIMEOUT, connection);
    Ok(p.get_managed_objects().await?)
}

/// Read value from D-Bus dictionary.
pub(crate) fn read_dict<'a, T: 'static>(
    dict: &'a HashMap<String, Variant<Box<dyn RefArg + 'static>>>, key: &str,
) -> Result<&'a T> {
    prop_cast(dict, key)
        .ok_or_else(|| Error::new(ErrorKind::Internal(InternalErrorKind::MissingKey(key.to_string()))))
}

/// Result of calling one of our D-Bus methods.
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Call method on Arc D-Bus object we are serving.
pub(crate) fn method_call<
    T: Send + Sync + 'static,
    R: AppendAll + fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
>(
    mut ctx: dbus_crossroads::Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        let result = f(data).await;
        log::trace!(
            "{}: {}.{} (...) -> {:?}",
            ctx.path(),
            ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
            ctx.method(),
            &result
        );
        ctx.reply(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let addr: Address = "00:1B:66:AB:CD:EF".parse().unwrap();
        assert_eq!(addr.to_string(), "00:1B:66:AB:CD:EF");
        assert_eq!(addr.to_path_component(), "dev_00_1B_66_AB_CD_EF");
        assert_eq!(Address::parse_path_component("dev_00_1B_66_AB_CD_EF"), Some(addr));
    }

    #[test]
    fn address_rejects_garbage() {
        assert!("00:1B:66:AB:CD".parse::<Address>().is_err());
        assert!("zz:1B:66:AB:CD:EF".parse::<Address>().is_err());
        assert_eq!(Address::parse_path_component("dev_xx"), None);
    }

    #[test]
    fn error_name_round_trip() {
        let err = Error::new(ErrorKind::Busy);
        let method_err: dbus::MethodErr = err.into();
        assert!(format!("{method_err:?}").contains("org.bluad.Error.Busy"));
    }
}
