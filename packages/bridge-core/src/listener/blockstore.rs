use std::path::{Path, PathBuf};

use crate::types::ChainId;
use crate::{Error, Result};

/// 单条源链最后扫描的区块，以十进制保存在 `<dir>/chain-<id>.block`
#[derive(Debug, Clone)]
pub struct Blockstore {
    path: PathBuf,
}

impl Blockstore {
    pub fn new<P: AsRef<Path>>(dir: P, chain_id: ChainId) -> Self {
        Self {
            path: dir.as_ref().join(format!("chain-{}.block", chain_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 尚未存储时返回 `None`
    pub async fn get_last_block_number(&self) -> Result<Option<u64>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Config(format!(
                    "Failed to read blockstore {:?}: {}",
                    self.path, e
                )))
            }
        };
        text.trim().parse::<u64>().map(Some).map_err(|e| {
            Error::Config(format!("Corrupt blockstore {:?}: {}", self.path, e))
        })
    }

    pub async fn set_last_block_number(&self, block: u64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Config(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        tokio::fs::write(&self.path, block.to_string())
            .await
            .map_err(|e| Error::Config(format!("Failed to write blockstore {:?}: {}", self.path, e)))
    }
}
