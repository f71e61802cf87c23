//! Driver-marker-free interactive browser transport.
//!
//! For targets that inspect execution-environment signals on top of the
//! transport handshake. Chrome is launched with the automation-controlled
//! blink feature disabled so `navigator.webdriver` and friends stay unset.

use std::ffi::OsStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info};

use crate::error::{ScrapeError, ScrapeResult};
use crate::scrapers::transport::{
    looks_like_challenge, FetchResponse, Method, RequestSpec, Transport,
};

/// Transport variant driving a real browser session.
pub struct StealthBrowser {
    browser: Browser,
}

impl StealthBrowser {
    pub fn new() -> Result<Self> {
        info!("Launching headless Chrome...");

        let options = LaunchOptions::default_builder()
            .headless(true)
            .args(vec![
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--no-sandbox"),
            ])
            .build()
            .context("Failed to build launch options")?;

        let browser = Browser::new(options).context("Failed to launch Chrome browser")?;

        Ok(Self { browser })
    }

    /// Build the script that performs a real POST navigation by submitting
    /// an injected form. Values go through JSON encoding to stay escaped.
    fn post_script(spec: &RequestSpec) -> String {
        let mut script = String::from("const form = document.createElement('form');\n");
        script.push_str("form.method = 'POST';\n");
        script.push_str(&format!(
            "form.action = {};\n",
            serde_json::to_string(&spec.url).unwrap_or_default()
        ));
        for (name, value) in spec.form.as_deref().unwrap_or(&[]) {
            script.push_str(&format!(
                "{{ const input = document.createElement('input'); input.type = 'hidden'; input.name = {}; input.value = {}; form.appendChild(input); }}\n",
                serde_json::to_string(name).unwrap_or_default(),
                serde_json::to_string(value).unwrap_or_default(),
            ));
        }
        script.push_str("document.body.appendChild(form);\nform.submit();");
        script
    }
}

/// Navigate, read the rendered document and collect cookies. Split out so
/// the caller can close the tab on every exit path, including errors.
fn drive_tab(tab: &Tab, spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
    match spec.method {
        Method::Get => {
            tab.navigate_to(&spec.url)
                .map_err(|e| ScrapeError::transport(format!("{}: {e}", spec.url)))?;
        }
        Method::Post => {
            tab.evaluate(&StealthBrowser::post_script(spec), false)
                .map_err(|e| ScrapeError::transport(format!("{}: form submit: {e}", spec.url)))?;
        }
    }
    tab.wait_until_navigated()
        .map_err(|e| ScrapeError::transport(format!("{}: navigation: {e}", spec.url)))?;

    let html_result = tab
        .evaluate("document.documentElement.outerHTML", false)
        .map_err(|e| ScrapeError::transport(format!("{}: read document: {e}", spec.url)))?;
    let body = html_result
        .value
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let final_url = tab.get_url();

    let cookies = tab
        .get_cookies()
        .map(|cookies| {
            cookies
                .into_iter()
                .map(|c| (c.name, c.value))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if looks_like_challenge(&body) {
        return Err(ScrapeError::Blocked {
            status: 403,
            url: final_url,
        });
    }

    // A rendered document always reports 200 here; denial surfaces as a
    // challenge page, caught above.
    Ok(FetchResponse {
        status: 200,
        body,
        cookies,
        final_url,
    })
}

#[async_trait]
impl Transport for StealthBrowser {
    async fn fetch(&self, spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| ScrapeError::transport(format!("failed to open tab: {e}")))?;

        debug!(method = ?spec.method, url = %spec.url, "browser fetch");

        let result = drive_tab(&tab, spec);
        if let Err(e) = tab.close(true) {
            debug!(url = %spec.url, error = %e, "tab close failed");
        }
        result
    }

    fn name(&self) -> &'static str {
        "stealth-browser"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_script_escapes_form_values() {
        let spec = RequestSpec::post(
            "https://portal.example/courtrosters/",
            vec![("__VIEWSTATE".into(), "a\"b</script>".into())],
        );
        let script = StealthBrowser::post_script(&spec);
        assert!(script.contains("form.method = 'POST'"));
        assert!(script.contains("\"https://portal.example/courtrosters/\""));
        // JSON encoding keeps the quote and tag inert
        assert!(script.contains("a\\\"b</script>") || script.contains("a\\\"b<\\/script>"));
        assert!(script.ends_with("form.submit();"));
    }
}
