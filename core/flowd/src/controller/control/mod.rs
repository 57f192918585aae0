mod handle;
mod main_loop;
mod messages;

pub use handle::Controller;
