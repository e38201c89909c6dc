pub mod emitter;
pub mod errors;
pub mod history;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod reply;
pub mod store;
pub mod toolbox;
pub mod turn;
