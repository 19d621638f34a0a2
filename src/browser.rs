use anyhow::Result;
use chrono::{DateTime, Utc};
use headless_chrome::protocol::cdp::Emulation;
use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::ExtractError;

pub static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    ]
});

const MOBILE_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

pub const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

const CHROME_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-infobars",
    "--autoplay-policy=no-user-gesture-required",
    "--mute-audio",
];

/// Runs before any page script: hides the automation flags sites check for.
const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8 });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) return 'Intel Inc.';
        if (parameter === 37446) return 'Intel Iris OpenGL Engine';
        return getParameter.apply(this, [parameter]);
    };
    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
"#;

const LOGIN_URL_MARKERS: &[&str] = &["/login", "login.php", "/checkpoint/", "/accounts/login"];
const LOGIN_FORM_MARKERS: &[&str] = &["id=\"login_form\"", "name=\"login_form\"", "id=\"loginform\""];
const NOT_FOUND_MARKERS: &[&str] = &[
    "this content isn't available",
    "this content isn\u{2019}t available",
    "sorry, this page isn't available",
    "sorry, this page isn\u{2019}t available",
    "the link you followed may be broken",
    "this video is unavailable",
    "video unavailable",
    "page not found",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Desktop,
    Mobile,
}

/// How the automated page presents itself to the site.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientProfile {
    pub kind: ProfileKind,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_scale_factor: f64,
    /// Touch-style mobile viewport (meta viewport honoured, no scrollbars).
    pub mobile: bool,
}

impl ClientProfile {
    pub fn desktop() -> Self {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(FALLBACK_USER_AGENT);
        Self {
            kind: ProfileKind::Desktop,
            user_agent: user_agent.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            platform: "Win32".to_string(),
            viewport_width: 1920,
            viewport_height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }

    pub fn mobile() -> Self {
        Self {
            kind: ProfileKind::Mobile,
            user_agent: MOBILE_USER_AGENT.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            platform: "Linux armv8l".to_string(),
            viewport_width: 412,
            viewport_height: 915,
            device_scale_factor: 2.625,
            mobile: true,
        }
    }

    pub fn for_kind(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Desktop => Self::desktop(),
            ProfileKind::Mobile => Self::mobile(),
        }
    }
}

/// Response metadata seen on the wire; bodies are never read.
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    pub url: String,
    pub mime_type: String,
    pub status: u16,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

pub type ResponseCallback = Box<dyn Fn(ObservedResponse) + Send + Sync>;

/// One automated browser page.
pub trait PageSession: Send + Sync {
    fn apply_profile(&self, profile: &ClientProfile) -> Result<()>;
    /// Navigates and waits for the document body.
    fn navigate(&self, url: &str) -> Result<()>;
    fn current_url(&self) -> String;
    fn content(&self) -> Result<String>;
    /// Runs a script in the page and returns its (JSON) result.
    fn evaluate(&self, script: &str) -> Result<Value>;
    /// Subscribes to response metadata for the rest of the session.
    fn on_response(&self, callback: ResponseCallback) -> Result<()>;
    fn close(&self) -> Result<()>;
}

/// Hands out fresh page sessions.
pub trait SessionSource: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn PageSession>>;
}

/// Closes the wrapped session when dropped, whichever way the request ends.
pub struct SessionGuard {
    session: Arc<dyn PageSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn PageSession>) -> Self {
        Self {
            session: Arc::from(session),
        }
    }

    /// Handle for blocking work on another thread. The guard still owns
    /// the session's lifetime: dropping it closes the page even while
    /// clones are alive.
    pub fn shared(&self) -> Arc<dyn PageSession> {
        self.session.clone()
    }
}

impl Deref for SessionGuard {
    type Target = dyn PageSession;

    fn deref(&self) -> &Self::Target {
        &*self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.close() {
            warn!("Failed to close page session: {}", e);
        }
    }
}

// ============================================================================
// headless_chrome implementation
// ============================================================================

pub struct ChromeSession {
    tab: Arc<Tab>,
}

impl ChromeSession {
    fn new(tab: Arc<Tab>, timeout: Duration) -> Result<Self> {
        tab.set_default_timeout(timeout);
        tab.enable_debugger()?;
        tab.call_method(headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument {
            source: STEALTH_SCRIPT.to_string(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        })?;
        Ok(Self { tab })
    }
}

impl PageSession for ChromeSession {
    fn apply_profile(&self, profile: &ClientProfile) -> Result<()> {
        self.tab.set_user_agent(
            &profile.user_agent,
            Some(profile.accept_language.as_str()),
            Some(profile.platform.as_str()),
        )?;
        let mut headers = HashMap::new();
        headers.insert("Accept-Language", profile.accept_language.as_str());
        self.tab.set_extra_http_headers(headers)?;
        self.tab.call_method(device_metrics(profile))?;
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<()> {
        self.tab.navigate_to(url)?;
        // Body rather than the load event: ad and tracking requests keep
        // social pages "loading" long after the player is ready.
        if let Err(e) = self.tab.wait_for_element("body") {
            warn!("Body wait timed out on {}: {}", url, e);
        }
        Ok(())
    }

    fn current_url(&self) -> String {
        self.tab.get_url()
    }

    fn content(&self) -> Result<String> {
        self.tab.get_content()
    }

    fn evaluate(&self, script: &str) -> Result<Value> {
        let remote = self.tab.evaluate(script, false)?;
        Ok(remote.value.unwrap_or(Value::Null))
    }

    fn on_response(&self, callback: ResponseCallback) -> Result<()> {
        self.tab.register_response_handling(
            "media-scout",
            Box::new(move |event, _fetch_body| {
                let response = &event.response;
                callback(ObservedResponse {
                    url: response.url.clone(),
                    mime_type: response.mime_type.clone(),
                    status: response.status as u16,
                    headers: header_map(&response.headers),
                    observed_at: Utc::now(),
                });
            }),
        )?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.tab.close(true)?;
        Ok(())
    }
}

fn device_metrics(profile: &ClientProfile) -> Emulation::SetDeviceMetricsOverride {
    Emulation::SetDeviceMetricsOverride {
        width: profile.viewport_width,
        height: profile.viewport_height,
        device_scale_factor: profile.device_scale_factor,
        mobile: profile.mobile,
        scale: None,
        screen_width: Some(profile.viewport_width),
        screen_height: Some(profile.viewport_height),
        position_x: None,
        position_y: None,
        dont_set_visible_size: None,
        screen_orientation: None,
        viewport: None,
        display_feature: None,
        device_posture: None,
    }
}

fn header_map<T: serde::Serialize>(headers: &T) -> HashMap<String, String> {
    let Ok(Value::Object(map)) = serde_json::to_value(headers) else {
        return HashMap::new();
    };
    map.into_iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k.to_lowercase(), value)
        })
        .collect()
}

/// Process-wide Chrome instance: launched on first use, relaunched only if
/// it stops answering, and dropped at shutdown. Requests get their own tabs
/// and never close the browser itself.
pub struct SharedBrowser {
    chrome_path: PathBuf,
    page_timeout: Duration,
    inner: Mutex<Option<Browser>>,
}

impl SharedBrowser {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            chrome_path: config.chrome_path.clone(),
            page_timeout: config.navigation_timeout,
            inner: Mutex::new(None),
        }
    }

    fn handle(&self) -> Result<Browser> {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(browser) = slot.as_ref() {
            if browser.get_version().is_ok() {
                return Ok(browser.clone());
            }
            warn!("Shared browser stopped responding, relaunching");
        }
        let browser = self.launch()?;
        *slot = Some(browser.clone());
        Ok(browser)
    }

    fn launch(&self) -> Result<Browser> {
        let path = if self.chrome_path.exists() {
            Some(self.chrome_path.clone())
        } else {
            warn!(
                "Chrome not found at {}, falling back to auto-detection",
                self.chrome_path.display()
            );
            None
        };
        info!("🚀 Launching shared browser");
        let browser = Browser::new(LaunchOptions {
            headless: true,
            window_size: Some((1920, 1080)),
            path,
            args: CHROME_ARGS.iter().map(OsStr::new).collect(),
            idle_browser_timeout: Duration::from_secs(60 * 60 * 24 * 365),
            ..Default::default()
        })?;
        Ok(browser)
    }

    /// Drops the browser process; later requests relaunch it.
    pub fn shutdown(&self) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            info!("Shared browser shut down");
        }
    }
}

impl SessionSource for SharedBrowser {
    fn open_session(&self) -> Result<Box<dyn PageSession>> {
        let browser = self.handle()?;
        let tab = browser.new_tab()?;
        Ok(Box::new(ChromeSession::new(tab, self.page_timeout)?))
    }
}

// ============================================================================
// Address variants and page classification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressVariant {
    pub url: String,
    pub profile: ProfileKind,
}

/// Deterministic rewrites of a content address to try in order: the
/// original, the mobile/desktop host swap, then the alternate path form.
pub fn address_variants(address: &str, max: usize) -> Vec<AddressVariant> {
    let mut variants: Vec<AddressVariant> = Vec::new();
    let mut push = |url: String| {
        let profile = profile_for(&url);
        if !variants.iter().any(|v| v.url == url) {
            variants.push(AddressVariant { url, profile });
        }
    };

    push(address.to_string());

    if let Ok(parsed) = Url::parse(address) {
        if let Some(host) = parsed.host_str() {
            let swapped = if let Some(rest) = host.strip_prefix("www.") {
                format!("m.{}", rest)
            } else if let Some(rest) = host.strip_prefix("m.") {
                format!("www.{}", rest)
            } else {
                format!("m.{}", host)
            };
            let mut rewritten = parsed.clone();
            if rewritten.set_host(Some(&swapped)).is_ok() {
                push(rewritten.to_string());
            }
        }
        if let Some(alternate) = alternate_path_form(&parsed) {
            push(alternate);
        }
    }

    variants.truncate(max.max(1));
    variants
}

fn profile_for(url: &str) -> ProfileKind {
    let is_mobile_host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.starts_with("m.")))
        .unwrap_or(false);
    if is_mobile_host {
        ProfileKind::Mobile
    } else {
        ProfileKind::Desktop
    }
}

/// `/reel/<id>` <-> `/watch/?v=<id>`.
fn alternate_path_form(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["reel", id] | ["reels", id] if id.chars().all(|c| c.is_ascii_digit()) => {
            Some(format!("{}://{}/watch/?v={}", url.scheme(), host, id))
        }
        ["watch"] => {
            let id = url.query_pairs().find(|(k, _)| k == "v").map(|(_, v)| v.into_owned())?;
            Some(format!("{}://{}/reel/{}", url.scheme(), host, id))
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Ready,
    LoginWall,
    NotFound,
}

pub fn classify_page(final_url: &str, html: &str) -> PageState {
    let url = final_url.to_lowercase();
    if LOGIN_URL_MARKERS.iter().any(|m| url.contains(m)) {
        return PageState::LoginWall;
    }

    let lower = html.to_lowercase();
    // Public video pages embed a login overlay too; only a login form with
    // no trace of a player counts as a wall.
    let has_player = lower.contains("<video") || lower.contains("playable_url") || lower.contains("videoobject");
    if !has_player && LOGIN_FORM_MARKERS.iter().any(|m| lower.contains(m)) {
        return PageState::LoginWall;
    }
    if !has_player && NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        return PageState::NotFound;
    }
    PageState::Ready
}

/// A loaded page plus the address variant that worked.
pub struct OpenedPage {
    pub session: SessionGuard,
    pub address: String,
    pub profile: ProfileKind,
}

/// Opens a session and walks the address variants until one loads without
/// a login wall or "not found" text.
pub async fn open_page(
    source: &dyn SessionSource,
    address: &str,
    config: &AppConfig,
) -> Result<OpenedPage, ExtractError> {
    let session = SessionGuard::new(source.open_session()?);
    let mut failures: Vec<String> = Vec::new();

    for variant in address_variants(address, config.max_address_variants) {
        info!("Loading page: {} ({:?} profile)", variant.url, variant.profile);
        session.apply_profile(&ClientProfile::for_kind(variant.profile))?;

        if let Err(e) = session.navigate(&variant.url) {
            warn!("Navigation to {} failed: {}", variant.url, e);
            failures.push(format!("{}: navigation failed", variant.url));
            continue;
        }
        sleep(config.settle_delay).await;

        let html = session.content().unwrap_or_default();
        let final_url = session.current_url();
        match classify_page(&final_url, &html) {
            PageState::Ready => {
                debug!("Page ready at {}", final_url);
                return Ok(OpenedPage {
                    session,
                    address: variant.url,
                    profile: variant.profile,
                });
            }
            state => {
                warn!("{} is not usable: {:?}", variant.url, state);
                failures.push(format!("{}: {:?}", variant.url, state));
            }
        }
    }

    Err(ExtractError::PageUnavailable(failures.join("; ")))
}
