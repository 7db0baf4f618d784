// Page fetcher for the GraphQL "Following" endpoint.
//
// Every request picks a fresh credential from the pool, so retrying the same
// cursor after an authorization failure naturally rotates to another session.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE, USER_AGENT};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};

use super::audit::AuditLog;
use super::credentials::CredentialPool;
use super::error::FetchError;
use super::response::{parse_page, Page};
use crate::db::models::Credential;

/// Production endpoint.
pub const DEFAULT_FOLLOWING_URL: &str =
    "https://x.com/i/api/graphql/pbhw14as2BgZvJAwAbVJpg/Following";

/// Accounts requested per page.
pub const PAGE_SIZE: u32 = 40;

/// Fixed feature-flag blob the endpoint requires alongside `variables`.
pub const FEATURES: &str = concat!(
    r#"{"profile_label_improvements_pcf_label_in_post_enabled":true,"#,
    r#""rweb_tipjar_consumption_enabled":true,"#,
    r#""responsive_web_graphql_exclude_directive_enabled":true,"#,
    r#""verified_phone_label_enabled":false,"#,
    r#""creator_subscriptions_tweet_preview_api_enabled":true,"#,
    r#""responsive_web_graphql_timeline_navigation_enabled":true,"#,
    r#""responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"#,
    r#""premium_content_api_read_enabled":false,"#,
    r#""communities_web_enable_tweet_community_results_fetch":true,"#,
    r#""c9s_tweet_anatomy_moderator_badge_enabled":true,"#,
    r#""responsive_web_grok_analyze_button_fetch_trends_enabled":false,"#,
    r#""responsive_web_grok_analyze_post_followups_enabled":true,"#,
    r#""responsive_web_grok_share_attachment_enabled":true,"#,
    r#""articles_preview_enabled":true,"#,
    r#""responsive_web_edit_tweet_api_enabled":true,"#,
    r#""graphql_is_translatable_rweb_tweet_is_translatable_enabled":true,"#,
    r#""view_counts_everywhere_api_enabled":true,"#,
    r#""longform_notetweets_consumption_enabled":true,"#,
    r#""responsive_web_twitter_article_tweet_consumption_enabled":true,"#,
    r#""tweet_awards_web_tipping_enabled":false,"#,
    r#""creator_subscriptions_quote_tweet_preview_enabled":false,"#,
    r#""freedom_of_speech_not_reach_fetch_enabled":true,"#,
    r#""standardized_nudges_misinfo":true,"#,
    r#""tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled":true,"#,
    r#""rweb_video_timestamps_enabled":true,"#,
    r#""longform_notetweets_rich_text_read_enabled":true,"#,
    r#""longform_notetweets_inline_media_enabled":true,"#,
    r#""responsive_web_enhance_cards_enabled":false}"#,
);

/// Anything that can fetch one page of a subject's following list.
///
/// The crawl controller only depends on this trait, so tests can script
/// page sequences without HTTP.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// `cursor` is empty for the first page.
    async fn fetch_page(&self, subject_id: &str, cursor: &str) -> Result<Page, FetchError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Variables<'a> {
    user_id: &'a str,
    count: u32,
    include_promoted_content: bool,
    cursor: &'a str,
}

pub struct FollowingClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Arc<CredentialPool>,
    audit: AuditLog,
}

impl FollowingClient {
    pub fn new(
        endpoint: &str,
        credentials: Arc<CredentialPool>,
        audit: AuditLog,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FetchError::api(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            credentials,
            audit,
        })
    }

    fn headers(credential: &Credential) -> Result<HeaderMap, FetchError> {
        let value = |raw: &str, name: &str| {
            HeaderValue::from_str(raw).map_err(|_| {
                FetchError::api(format!(
                    "credential {} has an invalid {name} header",
                    credential.handle
                ))
            })
        };

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, value(&credential.cookie, "cookie")?);
        headers.insert(AUTHORIZATION, value(&credential.auth_token, "authorization")?);
        headers.insert("x-csrf-token", value(&credential.csrf_token, "x-csrf-token")?);
        headers.insert(USER_AGENT, value(&credential.user_agent, "user-agent")?);
        Ok(headers)
    }
}

/// A cursor the API may echo back in an error payload.
fn resume_cursor(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("next_cursor")?
        .as_str()
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl PageSource for FollowingClient {
    async fn fetch_page(&self, subject_id: &str, cursor: &str) -> Result<Page, FetchError> {
        let credential = self.credentials.select()?;
        let headers = Self::headers(credential)?;

        let variables = serde_json::to_string(&Variables {
            user_id: subject_id,
            count: PAGE_SIZE,
            include_promoted_content: false,
            cursor,
        })?;

        debug!(subject_id, cursor, credential = %credential.handle, "Fetching following page");

        let response = self
            .client
            .get(&self.endpoint)
            .headers(headers)
            .query(&[("variables", variables.as_str()), ("features", FEATURES)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        self.audit.record_response(cursor, &body);

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(
                subject_id,
                status = status.as_u16(),
                credential = %credential.handle,
                "Authorization error from following endpoint"
            );
            return Err(FetchError::Authorization {
                status: status.as_u16(),
                resume_cursor: resume_cursor(&body),
                body,
            });
        }

        if !status.is_success() {
            return Err(FetchError::Api {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        parse_page(&body)
    }
}
