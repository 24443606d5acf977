pub type DieselError = diesel::result::Error;

pub type DbPool = diesel_async::pooled_connection::bb8::Pool<diesel_async::AsyncPgConnection>;
