mod error;
mod sessions;
mod stream;

pub use error::ApiError;

use rocket::Route;

pub fn routes() -> Vec<Route> {
    rocket::routes![
        sessions::create_session,
        sessions::get_session,
        sessions::get_progress,
        sessions::cancel_session,
        sessions::search_items,
        stream::stream_session,
    ]
}
