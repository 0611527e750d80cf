// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to plug and unplug VIFs into a vRouter

use clap::Parser;
use vif_plug_vrouter::dispatch::{fatal, CmdError, VrouterVifApp};

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let app = VrouterVifApp::try_parse().map_err(|err| match err.kind() {
        clap::error::ErrorKind::DisplayHelp
        | clap::error::ErrorKind::DisplayVersion => err.exit(),
        _ => CmdError::Usage(err.to_string()),
    })?;
    app.exec().await.map_err(CmdError::Failure)
}
