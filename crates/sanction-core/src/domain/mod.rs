//! Domain model of the approval engine

pub mod approval_instance;
pub mod clock;
pub mod decision;
pub mod delegation;
pub mod events;
pub mod policy;
pub mod repository;
pub mod stage_instance;
pub mod template;
