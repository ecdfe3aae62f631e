//! Probe deciding whether a URL may be embedded in an iframe: HEAD with a
//! short timeout, GET as fallback for servers rejecting HEAD, and an
//! allow-list that skips the probe entirely.

use std::time::Duration;

use protocol::EmbeddableState;

/// Probes answer within this window or count as unreachable.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Some sites (the LinkedIn idiom) answer 999: reachable, but they refuse
/// automated requests and will refuse the iframe too.
const STATUS_REACHABLE_BUT_BLOCKED: u16 = 999;

pub struct EmbeddableChecker {
    http: reqwest::Client,
    allowlist: Vec<String>,
}

impl EmbeddableChecker {
    pub fn new(allowlist: Vec<String>) -> Self {
        EmbeddableChecker {
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("HTTP client construction"),
            allowlist,
        }
    }

    /// Classifies one URL. Never fails; unreachable targets are an answer,
    /// not an error.
    pub async fn verify(&self, url: &str) -> (EmbeddableState, Option<String>) {
        if self.allowlist.iter().any(|domain| url.contains(domain)) {
            return (EmbeddableState::Embeddable, None);
        }

        let head = self.http.head(url).send().await;
        let response = match head {
            Ok(response) if response.status().as_u16() == 405 => {
                // The server refuses HEAD; retry with GET.
                match self.http.get(url).send().await {
                    Ok(response) => response,
                    Err(err) => return unreachable_answer(err),
                }
            }
            Ok(response) => response,
            Err(err) => return unreachable_answer(err),
        };

        let x_frame_options = response
            .headers()
            .get("x-frame-options")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        classify(response.status().as_u16(), x_frame_options.as_deref())
    }
}

fn unreachable_answer(err: reqwest::Error) -> (EmbeddableState, Option<String>) {
    tracing::debug!(?err, "Embeddable probe failed.");
    (
        EmbeddableState::Unreachable,
        Some("The target website could not be reached.".into()),
    )
}

/// Pure classification over the probe result.
pub fn classify(status: u16, x_frame_options: Option<&str>) -> (EmbeddableState, Option<String>) {
    if status == STATUS_REACHABLE_BUT_BLOCKED {
        return (
            EmbeddableState::NotEmbeddable,
            Some("The target website is reachable but blocks automated access.".into()),
        );
    }
    match x_frame_options.map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if value == "deny" || value == "sameorigin" => (
            EmbeddableState::NotEmbeddable,
            Some("The target website forbids embedding via X-Frame-Options.".into()),
        ),
        _ => (EmbeddableState::Embeddable, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_options_decide_embeddability() {
        assert_eq!(classify(200, None).0, EmbeddableState::Embeddable);
        assert_eq!(
            classify(200, Some("DENY")).0,
            EmbeddableState::NotEmbeddable
        );
        assert_eq!(
            classify(200, Some(" sameorigin ")).0,
            EmbeddableState::NotEmbeddable
        );
        assert_eq!(
            classify(200, Some("allow-from https://example.com")).0,
            EmbeddableState::Embeddable
        );
    }

    #[test]
    fn status_999_is_reachable_but_blocked() {
        let (state, message) = classify(999, None);
        assert_eq!(state, EmbeddableState::NotEmbeddable);
        assert!(message.is_some());
    }

    #[tokio::test]
    async fn the_allowlist_short_circuits_the_probe() {
        let checker = EmbeddableChecker::new(vec!["trusted.example".into()]);
        let (state, message) = checker
            .verify("https://trusted.example/widget")
            .await;
        assert_eq!(state, EmbeddableState::Embeddable);
        assert!(message.is_none());
    }
}
