#[macro_use]
extern crate rocket;

mod api;
mod classifier;
mod config;
mod sentiment;
mod types;


#[launch]
fn rocket() -> _ {
    api::mount(rocket::build().attach(sentiment::stage()))
}
