use std::fmt;
use std::io;

/// Host-side failures: I/O, resource exhaustion, bad configuration,
/// invalid CLI arguments, or an internal invariant violation. These
/// never originate inside the engine's step loop; a guest fault is
/// always represented by `crate::core::cpu::Fault` instead.
#[derive(Debug)]
pub enum HostError {
    Io(String),
    Mem(String),
    Init(String),
    Parm(String),
    Intern(String),
}

impl HostError {
    /// Exit code the reference binary returns for this error, numbered
    /// after the original simulator's ERR_* constants.
    pub fn exit_code(&self) -> i32 {
        match self {
            HostError::Io(_) => 1,
            HostError::Mem(_) => 2,
            HostError::Init(_) => 3,
            HostError::Parm(_) => 4,
            HostError::Intern(_) => 5,
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Io(msg) => write!(f, "I/O error: {msg}"),
            HostError::Mem(msg) => write!(f, "out of memory: {msg}"),
            HostError::Init(msg) => write!(f, "initialization failed: {msg}"),
            HostError::Parm(msg) => write!(f, "invalid parameter: {msg}"),
            HostError::Intern(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for HostError {}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        HostError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for HostError {
    fn from(e: serde_yaml::Error) -> Self {
        HostError::Parm(e.to_string())
    }
}
