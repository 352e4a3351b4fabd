// vim: tw=80
//! RAID-Y's own on-disk label record.
//!
//! Placed immediately after the host's label region (`VDEV_LABEL_START_SIZE`,
//! unchanged and out of this crate's scope) and before the activemap
//! replica. Serialized with `bincode`, the same codec the teacher wraps with
//! `LabelReader`/`LabelWriter` for its own on-disk structured records
//! (`mirror.rs`'s `Label`); this crate talks to `bincode` directly since
//! `LabelReader`/`LabelWriter` are part of the host label machinery this
//! crate treats as an external collaborator.

use divbuf::DivBufShared;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    types::{ByteT, RAIDY_LABEL_SLOT_SIZE},
    vdev::ChildVdev,
};

/// Identifies a RAID-Y vdev and this child's place in it. Read back at
/// `open()` and compared against the supplied `Config` so that a
/// `children`/`nparity` mismatch is caught as `Error::ConfigurationInvalid`
/// rather than silently corrupting data.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaidyLabel {
    pub vdev_uuid: Uuid,
    pub nparity: u8,
    pub ndata: u8,
    pub stripe_size: u32,
    pub child_index: u32,
}

impl RaidyLabel {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(self)
            .map_err(|e| Error::ConfigurationInvalid(format!("label encode: {e}")))?;
        if buf.len() > RAIDY_LABEL_SLOT_SIZE as usize {
            return Err(Error::ConfigurationInvalid(
                "label does not fit its on-disk slot".to_string(),
            ));
        }
        buf.resize(RAIDY_LABEL_SLOT_SIZE as usize, 0);
        Ok(buf)
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf)
            .map_err(|e| Error::ConfigurationInvalid(format!("label decode: {e}")))
    }
}

/// Read and decode a child's `RaidyLabel` from its reserved slot.
pub async fn read_label(child: &dyn ChildVdev, offset: ByteT) -> Result<RaidyLabel> {
    let dbs = DivBufShared::from(vec![0u8; RAIDY_LABEL_SLOT_SIZE as usize]);
    let buf = child.read_at(dbs, offset).await?;
    RaidyLabel::from_bytes(&buf)
}

/// Encode and write a `RaidyLabel` into a child's reserved slot.
pub async fn write_label(child: &dyn ChildVdev, offset: ByteT, label: &RaidyLabel) -> Result<()> {
    let bytes = label.to_bytes()?;
    let dbs = DivBufShared::from(bytes);
    let buf = dbs
        .try_const()
        .map_err(|_| Error::ConfigurationInvalid("label buffer busy".to_string()))?;
    child.write_at(buf, offset).await
}
