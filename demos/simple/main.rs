use posthog::{ClientConfig, EvaluationContext, Event};

pub fn main() -> posthog::Result<()> {
    // Configure env_logger to see PostHog SDK logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("posthog")).init();

    let api_key = std::env::var("POSTHOG_API_KEY")
        .expect("POSTHOG_API_KEY env variable should contain the project API key");
    let mut config = ClientConfig::new(api_key).with_on_error(|err, batch| {
        println!("Dropped {} events: {err}", batch.len());
    });
    if let Ok(host) = std::env::var("POSTHOG_HOST") {
        config = config.with_host(host);
    }
    // Local evaluation needs a personal API key.
    if let Ok(personal_api_key) = std::env::var("POSTHOG_PERSONAL_API_KEY") {
        config = config.with_personal_api_key(personal_api_key);
    }
    let client = config.to_client()?;

    // Block waiting for flag definitions. Until this call returns, flags are evaluated remotely.
    if let Err(err) = client.wait_for_definitions() {
        println!("error requesting flag definitions: {:?}", err);
    }

    let context = EvaluationContext::new("test-subject").with_person_property("plan", "pro");
    let enabled = client
        .is_feature_enabled("beta-feature", &context)
        // default value
        .unwrap_or(false);
    println!("beta-feature: {enabled}");

    let event = Event::new("demo ran", "test-subject").with_property("beta", enabled);
    if let Err(err) = client.capture(event) {
        println!("event not queued: {err}");
    }

    client.shutdown()
}
