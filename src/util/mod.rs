pub mod bitmap;
pub mod checksum;
pub mod endian;
pub mod queue;

pub use bitmap::Bitmap;
pub use queue::WaitQueue;
