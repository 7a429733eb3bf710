// =============================================================================
// Palaver Matrix Homeserver - Test Utilities Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Shared test scaffolding: initializes the global services once over the
//   memory engine with an in-memory federation peer, and provides helpers
//   for seeding users.
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

use std::sync::{Arc, OnceLock};

use crate::{
    mxid::UserId,
    service::fetch::MemoryFetchClient,
    services, Config, KeyValueDatabase, Services,
};

static TEST_INIT: OnceLock<Arc<MemoryFetchClient>> = OnceLock::new();

pub fn create_test_config() -> Config {
    toml::from_str(
        r#"
        server_name = "palaver.test"
        viewport_size = 96
        fetch_width = 16
        "#,
    )
    .expect("test config is valid")
}

/// Initializes the global services over the memory engine exactly once per
/// process; repeated calls return the same instance.
pub fn init_test_services() -> &'static Services {
    TEST_INIT.get_or_init(|| {
        let config = create_test_config();
        let fetch_client = Arc::new(MemoryFetchClient::new());

        let db: &'static KeyValueDatabase = Box::leak(Box::new(
            KeyValueDatabase::load_or_create(&config).expect("memory database opens"),
        ));
        let built = Services::build_with_fetcher(db, config, fetch_client.clone())
            .expect("services build");
        crate::init_services(Box::leak(Box::new(built)));

        services()
            .keys
            .publish_own_key()
            .expect("own key publication");

        fetch_client
    });

    services()
}

/// The in-memory federation peer the test services fetch from.
pub fn test_fetch_client() -> Arc<MemoryFetchClient> {
    init_test_services();
    TEST_INIT.get().expect("initialized above").clone()
}

/// Seeds a local user with an access token and returns the user ID.
pub fn register_test_user(localpart: &str, token: &str) -> UserId {
    let services = init_test_services();
    let user_id = UserId::parse(format!(
        "@{}:{}",
        localpart,
        services.globals.server_name()
    ))
    .expect("test user id is valid");

    services
        .users
        .set_access_token(&user_id, token)
        .expect("token registration");

    user_id
}
