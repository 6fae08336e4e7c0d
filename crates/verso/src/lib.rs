//! VERSO: a per-target, single-node, transactional, multiversion object
//! store.
//!
//! The data model is pool → container → object → dkey → akey → value, with
//! every write stamped by an epoch and every read filtered by one. Array
//! values live in extent trees, single values in epoch-keyed btrees; punch
//! writes tombstones instead of deleting, so the full history of a
//! namespace stays addressable until aggregation reclaims it.
//!
//! One engine instance is owned by one xstream; nothing here is `Sync`,
//! and the only suspension points are BIO submission, transaction commit,
//! and tree probes that can block on distributed-transaction resolution.

pub mod container;
pub mod io;
pub mod iter;
pub mod object;
pub mod pool;
pub mod query;
pub mod tree;

pub use container::{cont_close, cont_create, cont_destroy, cont_open, VosContainer};
pub use io::{
    obj_fetch, obj_punch, obj_update, oi_clear_attr, oi_get_attr, oi_set_attr, zc_fetch,
    zc_update, FetchResult, IoVec, Iod, IodType, SgList,
};
pub use iter::{
    iter_nested, iter_prepare, EpochExpr, IterEntry, IterParam, IterType, VosIter,
};
pub use object::{ObjCache, ObjRecord, VosObject, OI_PUNCHED, OI_REMOVED};
pub use pool::VosPool;
pub use query::{query_key, QueryFlags, QueryResult};
pub use tree::{visibility, DtxHandle, KeyBody, KeyRecord, SingleValue, Visibility};
