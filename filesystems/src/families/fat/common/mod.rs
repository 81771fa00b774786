// Machinery shared by every FAT sub-type: the sector window, the FAT and
// bitmap codecs, the cluster allocator, the name codecs, timestamps and
// the open-object share table.

pub mod allocator;
pub mod bitmap;
pub mod fat_table;
pub mod names;
pub mod share;
pub mod timestamps;
pub mod upcase;
pub mod window;

pub use share::{ShareAccess, ShareTable};
pub use timestamps::{SystemTimeSource, TimeSource};
