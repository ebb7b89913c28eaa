use actix_identity::IdentityMiddleware;
use actix_web::{
    cookie::Key,
    middleware,
    web::{self, Data},
    App, HttpServer,
};
use bidhub::{config::Settings, credentials::CredentialStore, db, routes, AppState};
use log::info;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = Settings::from_env().map_err(|e| {
        log::error!("FATAL: {}", e);
        e
    })?;

    let db_pool = db::connect(&settings.database_url).await?;
    db::migrate(&db_pool).await?;

    let credentials = CredentialStore::from_settings(&settings)?;
    let session_key = Key::from(settings.session_key.as_slice());
    let cookie_secure = settings.cookie_secure;
    let bind_addr = settings.bind_addr.clone();
    let port = settings.port;
    let state = AppState::new(db_pool, credentials, settings);

    info!("Starting HTTP server on http://{}:{}/", bind_addr, port);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Compress::default())
            .wrap(IdentityMiddleware::default())
            .wrap(routes::session_layer(session_key.clone(), cookie_secure))
            // Logger last so it wraps the whole stack.
            .wrap(middleware::Logger::default())
            .app_data(Data::new(state.clone()))
            .configure(routes::configure)
            .default_service(web::to(routes::default_handler))
    })
    .bind((bind_addr.as_str(), port))?
    .run()
    .await
}
