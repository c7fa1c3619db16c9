pub mod init;
pub mod mount;
pub mod version;

pub use init::Init;
pub use mount::Mount;
pub use version::Version;
