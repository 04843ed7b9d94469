// Copyright 2025 Accord project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use num_enum::{IntoPrimitive, TryFromPrimitive};

///
/// Outcome codes visible to the layers above the core. The numeric values are stable and part
/// of the public surface.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    /// The remote answered with a JSON error message.
    Json = 1,
    /// The authentication token was rejected.
    BadAuth = 2,
    /// The client is being ratelimited.
    Ratelimit = 3,
    /// The connection could not be established or was lost for good.
    Connection = 4,
}

impl Code {
    pub fn description(self) -> &'static str {
        match self {
            Code::Ok => "success",
            Code::Json => "received a JSON error message",
            Code::BadAuth => "bad authentication token",
            Code::Ratelimit => "being ratelimited",
            Code::Connection => "couldn't establish or keep a connection to the gateway",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}
