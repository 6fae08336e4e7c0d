//! Pool lifecycle.
//!
//! A pool is one PM arena plus one NVMe blob, owned by a single xstream.
//! The PM root cell records the layout magic, version, blob identity, and
//! the container-index root; it is validated whenever a pool handle is
//! (re)attached, mirroring the blob-header check on the BIO side.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use verso_bio::{FileDev, IoContext, MallocDev};
use verso_btree as btree;
use verso_error::{Result, VosError};
use verso_mem::PmPool;
use verso_types::limits::OBJ_CACHE_CAPACITY;
use verso_types::{
    AllCommitted, BdevClass, Cx, DtxResolver, FaultHook, InstanceConfig, Intent, KeyClass, NoFault,
    PmAddr,
};

use crate::object::ObjCache;
use crate::tree::{DtxHandle, TreeCtx};

/// Magic stamped into the PM root cell.
pub const POOL_MAGIC: u32 = 0x5645_5253;
/// Current PM layout version.
pub const POOL_VERSION: u32 = 1;

/// PM root cell of a pool.
#[derive(Debug, Clone)]
pub struct PoolRoot {
    pub magic: u32,
    pub version: u32,
    pub blob_id: u64,
    pub cont_index: PmAddr,
}

/// An open pool handle. Exactly one exists per pool per xstream.
pub struct VosPool {
    uuid: Uuid,
    pub(crate) pm: PmPool,
    pub(crate) io: IoContext,
    pub(crate) cache: ObjCache,
    pub(crate) resolver: Box<dyn DtxResolver>,
    root: PmAddr,
}

impl std::fmt::Debug for VosPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VosPool")
            .field("uuid", &self.uuid)
            .field("pm", &self.pm)
            .field("cached_objects", &self.cache.len())
            .finish()
    }
}

impl VosPool {
    /// Create and format a pool per the instance configuration.
    pub fn create(uuid: Uuid, cfg: &InstanceConfig) -> Result<Self> {
        Self::create_with_fault_hook(uuid, cfg, Arc::new(NoFault))
    }

    /// Create a pool with a fault hook installed at the enumerated
    /// injection sites.
    pub fn create_with_fault_hook(
        uuid: Uuid,
        cfg: &InstanceConfig,
        fault: Arc<dyn FaultHook>,
    ) -> Result<Self> {
        cfg.validate()
            .map_err(|e| VosError::inval(e.to_string()))?;

        let mut pm = PmPool::with_fault_hook(cfg.scm_bytes(), fault);
        let blob_id = 1;
        let io = match cfg.bdev_class {
            BdevClass::Malloc => IoContext::format(
                Box::new(MallocDev::new()),
                cfg.first_core,
                blob_id,
                Uuid::new_v4(),
                uuid,
            )?,
            BdevClass::Nvme | BdevClass::Kdev | BdevClass::File => {
                let path = cfg
                    .bdev_list
                    .first()
                    .ok_or_else(|| VosError::inval("empty bdev_list"))?;
                IoContext::format(
                    Box::new(FileDev::create(path)?),
                    cfg.first_core,
                    blob_id,
                    Uuid::new_v4(),
                    uuid,
                )?
            }
        };

        let cx = Cx::new();
        let root = verso_mem::scoped_tx(&mut pm, &cx, |pm| {
            let cont_index = btree::create(pm, KeyClass::Opaque)?;
            pm.alloc(
                PoolRoot {
                    magic: POOL_MAGIC,
                    version: POOL_VERSION,
                    blob_id,
                    cont_index,
                },
                64,
            )
        })?;
        pm.set_root(root);
        debug!(%uuid, "pool formatted");

        Ok(Self {
            uuid,
            pm,
            io,
            cache: ObjCache::new(OBJ_CACHE_CAPACITY),
            resolver: Box::new(AllCommitted),
            root,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Install the DTX commit-state oracle.
    pub fn set_resolver(&mut self, resolver: Box<dyn DtxResolver>) {
        self.resolver = resolver;
    }

    /// Re-validate the PM root and blob header, as an open-path would.
    pub fn verify(&self) -> Result<()> {
        let root = self.pm.get::<PoolRoot>(self.root)?;
        if root.magic != POOL_MAGIC {
            warn!("pool root magic mismatch");
            return Err(VosError::io_inval("bad pool magic"));
        }
        if root.version != POOL_VERSION {
            return Err(VosError::proto(format!(
                "pool layout version {} unsupported",
                root.version
            )));
        }
        if self.io.header().pool_uuid != self.uuid {
            return Err(VosError::io_inval("blob does not belong to this pool"));
        }
        Ok(())
    }

    /// PM quota accounting, exported for space queries.
    pub fn space(&self) -> (u64, u64) {
        (self.pm.used(), self.pm.quota())
    }

    pub(crate) fn cont_index(&self) -> Result<PmAddr> {
        Ok(self.pm.get::<PoolRoot>(self.root)?.cont_index)
    }

    /// Build a tree lookup context for an operation.
    pub(crate) fn tree_ctx<'a>(
        resolver: &'a dyn DtxResolver,
        dth: Option<&DtxHandle>,
        intent: Intent,
    ) -> TreeCtx<'a> {
        TreeCtx {
            resolver,
            current: dth.map(|d| d.id),
            intent,
        }
    }

    /// Drop an object from the handle cache. Holders keep their handle;
    /// the next access rehydrates from PM.
    pub fn evict_object(&mut self, cont: &crate::container::VosContainer, oid: verso_types::ObjectId) {
        self.cache.evict(cont.uuid, oid);
    }

    /// Close the pool handle. All durable state lives in PM and the blob;
    /// the cache simply drains.
    pub fn close(self) {
        debug!(uuid = %self.uuid, "pool closed");
    }

    /// Destroy the pool, dropping the arena and blob.
    pub fn destroy(self) {
        debug!(uuid = %self.uuid, "pool destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{cont_create, cont_destroy, cont_open};

    fn config() -> InstanceConfig {
        InstanceConfig::default()
    }

    #[test]
    fn create_and_verify() {
        let uuid = Uuid::new_v4();
        let pool = VosPool::create(uuid, &config()).unwrap();
        assert_eq!(pool.uuid(), uuid);
        pool.verify().unwrap();
        let (used, quota) = pool.space();
        assert!(used > 0 && used < quota);
        pool.close();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config();
        cfg.scm_size = None;
        assert!(matches!(
            VosPool::create(Uuid::new_v4(), &cfg),
            Err(VosError::Inval { .. })
        ));
    }

    #[test]
    fn file_backed_blob() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.bdev_class = verso_types::BdevClass::File;
        cfg.bdev_list = vec![dir.path().join("blob0")];
        let pool = VosPool::create(Uuid::new_v4(), &cfg).unwrap();
        pool.verify().unwrap();
        pool.destroy();
    }

    #[test]
    fn container_lifecycle() {
        let mut pool = VosPool::create(Uuid::new_v4(), &config()).unwrap();
        let cx = Cx::new();
        let uuid = Uuid::new_v4();

        assert!(matches!(cont_open(&pool, uuid), Err(VosError::NonExist)));
        cont_create(&mut pool, &cx, uuid).unwrap();
        assert!(matches!(
            cont_create(&mut pool, &cx, uuid),
            Err(VosError::Exist)
        ));
        let cont = cont_open(&pool, uuid).unwrap();
        assert_eq!(cont.uuid, uuid);

        cont_destroy(&mut pool, &cx, uuid).unwrap();
        assert!(matches!(cont_open(&pool, uuid), Err(VosError::NonExist)));
        // Recreation after destroy works.
        cont_create(&mut pool, &cx, uuid).unwrap();
    }
}
