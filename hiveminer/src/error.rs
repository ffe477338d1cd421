// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! The hiveminer errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// JSON (de)serialization error.
    #[fail(display = "JSON: {}", _0)]
    Json(String),

    /// Object store access error.
    #[fail(display = "Store: {}", _0)]
    Store(String),

    /// Mine API access error.
    #[fail(display = "API: {}", _0)]
    Api(String),

    /// Compute provider error.
    #[fail(display = "Compute: {}", _0)]
    Compute(String),

    /// Instance metadata error.
    #[fail(display = "Metadata: {}", _0)]
    Metadata(String),

    /// Miner subprocess error.
    #[fail(display = "Miner: {}", _0)]
    Miner(String),

    /// Signing tool error.
    #[fail(display = "Signer: {}", _0)]
    Signer(String),

    /// Fatal configuration error.
    #[fail(display = "Config: {}", _0)]
    Config(String),

    /// The registry object does not exist yet.
    #[fail(display = "registry object is missing")]
    RegistryMissing,

    /// Conditional writes kept failing past the attempt cap.
    #[fail(display = "registry contention: {}", _0)]
    RegistryContention(String),

    /// No contiguous address range left for a new assignment.
    #[fail(display = "registry exhausted: {} addresses left, {} requested", _0, _1)]
    RegistryExhausted(usize, usize),

    /// Registry contents violate its invariants.
    #[fail(display = "registry invalid: {}", _0)]
    RegistryInvalid(String),
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(|info| ErrorKind::General(info)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Json(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
