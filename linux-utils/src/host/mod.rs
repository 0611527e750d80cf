// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on the host, with a seam for faking them under test.

pub mod error;
mod executor;
pub mod input;
pub mod output;

pub use error::ExecutionError;
pub use executor::{
    execute_allowing, BoxedExecutor, BoxedWaitFn, Executor, FakeExecutor,
    HostExecutor, StaticHandler, WaitFn,
};
pub use input::Input;
pub use output::{Output, OutputExt};
