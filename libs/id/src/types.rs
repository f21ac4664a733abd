//! Id types.

use crate::define_id;

// ===== Runtime =====

define_id!(InstanceId, "inst");

// ===== Task execution =====

define_id!(RunId, "run");
