//! Small numeric helpers shared by the pitch and staging code.

pub(crate) mod layout;
pub(crate) mod size;
