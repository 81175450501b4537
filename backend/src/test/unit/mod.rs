mod async_exec;
mod backend_facade;
mod kernels;
mod memory_planning;
mod pass_manager;
mod scenarios;
