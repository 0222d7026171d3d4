//! Application services

pub mod approval_engine;
pub mod stage_locks;
pub mod template_service;
