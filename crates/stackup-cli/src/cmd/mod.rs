pub mod deploy;
pub mod history;
pub mod init;
pub mod rollback;
pub mod snapshots;
pub mod status;
