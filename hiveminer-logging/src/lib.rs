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

//! Process-wide logging based on `slog`. The first call to `setup()` installs
//! a global asynchronous drain filtered by the `RUST_LOG` environment variable;
//! consumers then only need `use hiveminer_logging::macros::*;`.

pub mod macros {
    pub use slog_scope::{crit, debug, error, info, trace, warn};
}

// reexport for custom drain construction
pub use slog;
pub use slog_scope::logger;

use lazy_static::lazy_static;
use slog::Drain;

/// Bound on the number of log records buffered by the asynchronous drain
const ASYNC_CHANNEL_SIZE: usize = 2048;

lazy_static! {
    static ref LOGGER_GUARD: slog_scope::GlobalLoggerGuard = {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let format = slog_term::CompactFormat::new(decorator).build().fuse();
        let filter = slog_envlogger::new(format).fuse();
        let drain = slog_async::Async::new(filter)
            .chan_size(ASYNC_CHANNEL_SIZE)
            .build()
            .fuse();
        slog_scope::set_global_logger(slog::Logger::root(drain, slog::o!()))
    };
}

/// Install the global logger. Subsequent calls are no-ops.
///
/// The guard returned by slog-scope is intentionally kept for the lifetime of
/// the process so that the async drain is flushed on exit.
pub fn setup() {
    lazy_static::initialize(&LOGGER_GUARD);
}

#[cfg(test)]
mod test {
    use super::macros::*;
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        setup();
        setup();
        info!("logging facade is alive");
    }
}
