// src/agents/mod.rs

pub mod config;
pub mod stakeholder;
