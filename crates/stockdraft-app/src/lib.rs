// Library root: the draft session service and its process-level setup.

pub mod logging;
pub mod session;
