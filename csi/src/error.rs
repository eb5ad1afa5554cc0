//! Definition of DeviceError used by the node-plane helpers.
use std::string::FromUtf8Error;

pub struct DeviceError {
    pub message: String,
}

impl DeviceError {
    pub fn new(message: &str) -> DeviceError {
        DeviceError {
            message: String::from(message),
        }
    }
}

impl std::fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> DeviceError {
        DeviceError {
            message: format!("{}", error),
        }
    }
}

impl From<nix::Error> for DeviceError {
    fn from(error: nix::Error) -> DeviceError {
        DeviceError {
            message: format!("{}", error),
        }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError {
            message,
        }
    }
}

impl From<FromUtf8Error> for DeviceError {
    fn from(error: FromUtf8Error) -> DeviceError {
        DeviceError {
            message: format!("{}", error),
        }
    }
}
