//! The convolution engine (component A, §4.A). [`upola`] is the sole
//! convolver implementation: the teacher's fixed head/tail two-stage
//! convolver and pure time-domain FIR convolver are superseded by UPOLA's
//! geometric partition ladder (see DESIGN.md for the drop rationale) — every
//! cluster's main and HRTF buses are one [`upola::UpolaEngine`] each.

pub mod upola;

pub use upola::{Fdl, IrPartitions, PartitionPlan, UpolaEngine};
