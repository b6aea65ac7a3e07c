//! Call status codes and the status carried by error frames.
//!
//! Code numbers follow the gRPC status codes so that results can be compared
//! directly with other RPC stacks.

/// Status code of a completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    ResourceExhausted,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    /// Numeric value used on the wire
    pub fn as_u32(self) -> u32 {
        match self {
            Code::Ok => 0,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
        }
    }

    /// Decode a wire value. Numbers without a variant map to `Unknown`.
    pub fn from_u32(value: u32) -> Code {
        match value {
            0 => Code::Ok,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed call outcome: a code plus a human readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status {} ({}): {}", self.code.as_u32(), self.code, self.message)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Code; 9] = [
        Code::Ok,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
    ];

    #[test]
    fn test_wire_values() {
        assert_eq!(Code::FailedPrecondition.as_u32(), 9);
        assert_eq!(Code::Unavailable.as_u32(), 14);
        for code in ALL {
            assert_eq!(Code::from_u32(code.as_u32()), code);
        }
    }

    #[test]
    fn test_unassigned_values_are_unknown() {
        assert_eq!(Code::from_u32(1), Code::Unknown);
        assert_eq!(Code::from_u32(16), Code::Unknown);
        assert_eq!(Code::from_u32(u32::MAX), Code::Unknown);
    }

    #[test]
    fn test_status_display() {
        let status = Status::new(Code::InvalidArgument, "invalid length: 0");
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "invalid length: 0");
        assert_eq!(
            status.to_string(),
            "status 3 (InvalidArgument): invalid length: 0"
        );
    }
}
