use std::sync::Arc;

use callbridge::config::{Config, PhoneProviderKind};
use callbridge::manager::CallManager;
use callbridge::providers::stt::provider_for;
use callbridge::providers::telephony::{TelnyxTelephony, TwilioTelephony};
use callbridge::providers::tts::OpenAiCompatibleTts;
use callbridge::providers::{ProviderRegistry, TelephonyProvider};
use callbridge::webhook::{handle_rejection, routes};
use tracing_subscriber::EnvFilter;
use warp::Filter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("callbridge=info,warp=info")))
        .init();

    let config = Config::from_env().expect("invalid configuration");
    let config = Arc::new(config);

    let phone: Arc<dyn TelephonyProvider> = match config.phone_provider {
        PhoneProviderKind::Twilio => {
            Arc::new(TwilioTelephony::new(config.phone_account_sid.clone(), config.phone_auth_token.clone()))
        }
        PhoneProviderKind::Telnyx => Arc::new(
            TelnyxTelephony::new(config.phone_auth_token.clone(), config.telnyx_public_key.as_deref())
                .expect("invalid TELNYX_PUBLIC_KEY"),
        ),
    };

    let tts = Arc::new(OpenAiCompatibleTts::new(
        config.tts_api_key.clone(),
        config.tts_base_url.clone(),
        config.tts_voice.clone(),
        config.tts_model.clone(),
        config.tts_sample_rate,
    ));

    let stt = provider_for(config.stt_provider);

    let providers = ProviderRegistry { phone, tts, stt };
    let manager = CallManager::new(providers.clone(), config.clone());

    let log_requests = warp::log::custom(|info| {
        tracing::info!(
            "{} {} {} {}",
            info.remote_addr().map(|addr| addr.to_string()).unwrap_or_else(|| "???".into()),
            info.method(),
            info.path(),
            info.status()
        );
    });

    let routes = routes(manager, providers, config.media_ws_url(), config.status_callback_url())
        .recover(handle_rejection)
        .with(log_requests);

    tracing::info!(port = config.port, "callbridge starting");
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;
}
