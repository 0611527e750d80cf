// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// The guest instance a VIF is being plugged into.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub uuid: String,
    /// Display name of the instance.
    pub name: String,
    pub hostname: Option<String>,
    /// Compute host the instance is scheduled on.
    pub host: Option<String>,
    pub project_id: String,
    /// Whether the guest's flavor or image requested multi-queue virtio.
    #[serde(default)]
    pub virtio_multiqueue: bool,
    /// Set while the instance is being rebuilt in place.
    #[serde(default)]
    pub rebuilding: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn optional_fields_default() {
        let instance: InstanceInfo = serde_json::from_str(
            r#"{
                "uuid": "46a4308b-e75a-4f90-a34a-650c86ca18b2",
                "name": "instance-name",
                "project_id": "b168ea26fa0c49c1a84e1566d9565fa5"
            }"#,
        )
        .unwrap();
        assert_eq!(instance.hostname, None);
        assert!(!instance.virtio_multiqueue);
        assert!(!instance.rebuilding);
    }
}
