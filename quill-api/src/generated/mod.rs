// The log.v1.rs file is produced by build.rs (tonic-build) at compile time.
include!("log.v1.rs");
