//! Error type shared by the stack and the class drivers

use usb_device::UsbError;

/// Failure of a stack or class driver operation.
///
/// A failure returned from a SETUP dispatch is answered with a stall of the
/// control endpoint by the hardware layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Malformed call parameter or protocol field
    InvalidArgument,
    /// No matching device, driver, interface or session
    NotFound,
    /// A fixed-capacity table is full
    ResourceExhausted,
    /// Request or feature not available in this state, build or controller
    NotSupported,
    /// Power mode or session change refused by the controller
    TransitionFailed,
    /// Error reported by the controller
    Usb(UsbError),
}

impl From<UsbError> for Error {
    fn from(err: UsbError) -> Self {
        Error::Usb(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
