// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around Linux host commands used to plumb guest network devices.

pub mod destructor;
pub mod host;
pub mod link;

pub use host::error::CommandFailureInfo;
pub use host::error::ExecutionError;

pub const IP: &str = "ip";
pub const TUNCTL: &str = "tunctl";

/// Prefix for commands which must be run with elevated privileges.
///
/// On a compute host this is typically `sudo` or a rootwrap wrapper such as
/// `sudo nova-rootwrap /etc/nova/rootwrap.conf`. When no helper is
/// configured, commands are run directly, which is what a daemon already
/// running as root wants.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootHelper {
    argv: Vec<String>,
}

impl RootHelper {
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a helper from a whitespace-separated command line.
    pub fn new<S: AsRef<str>>(helper: S) -> Self {
        Self {
            argv: helper
                .as_ref()
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }

    /// Build a command for `program`, wrapped by the helper if one is set.
    pub fn command(&self, program: &str) -> tokio::process::Command {
        match self.argv.split_first() {
            Some((helper, helper_args)) => {
                let mut cmd = tokio::process::Command::new(helper);
                cmd.args(helper_args).arg(program);
                cmd
            }
            None => tokio::process::Command::new(program),
        }
    }
}

impl From<Option<String>> for RootHelper {
    fn from(helper: Option<String>) -> Self {
        helper.map(RootHelper::new).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::input::Input;

    #[test]
    fn root_helper_prefixes_program() {
        let helper = RootHelper::new("sudo -n");
        let cmd = helper.command(IP);
        let input = Input::from(cmd.as_std());
        assert_eq!(input.program, "sudo");
        assert_eq!(input.args, vec!["-n", "ip"]);

        let cmd = RootHelper::none().command(IP);
        let input = Input::from(cmd.as_std());
        assert_eq!(input.program, "ip");
        assert!(input.args.is_empty());
    }
}
