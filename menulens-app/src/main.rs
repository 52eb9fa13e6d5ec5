mod api;
mod registry;

use menulens_db::store::SessionStore;
use menulens_db::{MemoryStore, PgStore};
use menulens_pipeline::{Application, PipelineConfig};
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, launch};
use std::sync::Arc;

fn ephemeral_store_requested() -> bool {
    std::env::var("MENULENS_EPHEMERAL")
        .is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

async fn init_application(rocket: Rocket<Build>) -> Rocket<Build> {
    let config = PipelineConfig::config().expect("menulens configuration is invalid");

    let store: Arc<dyn SessionStore> = if ephemeral_store_requested() {
        log::warn!("MENULENS_EPHEMERAL is set; sessions will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let url = menulens_db::postgres_url_from_environment();
        let reset = config.auto_reset_database;
        let migration_url = url.clone();
        tokio::task::spawn_blocking(move || {
            menulens_db::migrations::run_migrations(&migration_url, reset)
        })
        .await
        .expect("migrations task panicked")
        .expect("failed to run database migrations");

        let pool = menulens_db::get_pool(&url, config.db_pool_size)
            .expect("couldn't create the database connection pool");
        Arc::new(PgStore::new(pool))
    };

    let chains =
        registry::build_stage_chains(&config).expect("provider configuration is invalid");
    let app = Application::start(config, store, chains);

    rocket.manage(app)
}

#[launch]
fn rocket() -> _ {
    env_logger::init();

    rocket::build()
        .mount("/api", api::routes())
        .attach(AdHoc::on_ignite("Pipeline", init_application))
}
