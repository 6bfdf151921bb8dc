//! Pages, arenas and the mark-sweep collector
pub mod address;
pub mod arena;
pub mod block;
pub mod classifier;
pub mod collect;
pub mod coordinator;
pub mod ephemeron;
pub mod freelist;
pub mod gcinfo;
pub mod guard;
pub mod header;
pub mod heap;
pub mod lob;
pub mod page;
pub mod persistent;
pub mod stack;
pub mod stats;
pub mod visitor;
