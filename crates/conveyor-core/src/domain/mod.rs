//! Domain model: definitions, instances, tasks, timers, and the
//! repository traits state backends implement.

pub mod definition;
pub mod events;
pub mod guard;
pub mod instance;
pub mod repository;
pub mod task;
pub mod timer;
