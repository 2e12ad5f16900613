pub mod tick;

pub use tick::run_tick_worker;
