//! User-agent classification: bot detection plus browser, OS and device
//! detection as three independent first-match-wins passes.

use std::sync::LazyLock;

use pulse_core::types::{DeviceType, ParsedUserAgent};
use regex::Regex;

const UNKNOWN: &str = "Unknown";

/// An ordered pattern table entry.
struct Rule {
    regex: Regex,
    label: &'static str,
    /// Match is discarded when this also matches.
    exclude: Option<Regex>,
}

type Pattern = (&'static str, &'static str, Option<&'static str>);

fn compile(table: &[Pattern]) -> Vec<Rule> {
    table
        .iter()
        .map(|&(pattern, label, exclude)| Rule {
            regex: Regex::new(pattern).expect("static user-agent pattern"),
            label,
            exclude: exclude.map(|p| Regex::new(p).expect("static user-agent pattern")),
        })
        .collect()
}

fn first_match<'a>(rules: &'a [Rule], ua: &str) -> Option<(&'a Rule, Option<String>)> {
    rules.iter().find_map(|rule| {
        let caps = rule.regex.captures(ua)?;
        if rule.exclude.as_ref().is_some_and(|ex| ex.is_match(ua)) {
            return None;
        }
        let version = caps.get(1).map(|m| m.as_str().to_string());
        Some((rule, version))
    })
}

// Lowest priority last: the generic catch-all only fires when nothing named does.
const BOT_PATTERNS: &[Pattern] = &[
    (r"(?i)googlebot|google-inspectiontool|adsbot-google", "Googlebot", None),
    (r"(?i)bingbot|bingpreview", "Bingbot", None),
    (r"(?i)yahoo! slurp|slurp", "Yahoo Slurp", None),
    (r"(?i)duckduckbot", "DuckDuckBot", None),
    (r"(?i)baiduspider", "Baiduspider", None),
    (r"(?i)yandex(?:bot|images|metrika)", "YandexBot", None),
    (r"(?i)sogou", "Sogou", None),
    (r"(?i)applebot", "Applebot", None),
    (r"(?i)facebookexternalhit|facebookcatalog", "Facebook", None),
    (r"(?i)twitterbot", "Twitterbot", None),
    (r"(?i)linkedinbot", "LinkedInBot", None),
    (r"(?i)slackbot|slack-imgproxy", "Slackbot", None),
    (r"(?i)discordbot", "Discordbot", None),
    (r"(?i)telegrambot", "TelegramBot", None),
    (r"(?i)whatsapp", "WhatsApp", None),
    (r"(?i)ahrefsbot", "AhrefsBot", None),
    (r"(?i)semrushbot", "SemrushBot", None),
    (r"(?i)mj12bot", "MJ12bot", None),
    (r"(?i)petalbot", "PetalBot", None),
    (r"(?i)gptbot|chatgpt-user", "GPTBot", None),
    (r"(?i)claudebot|claude-web", "ClaudeBot", None),
    (r"(?i)perplexitybot", "PerplexityBot", None),
    (r"(?i)ccbot", "CCBot", None),
    (r"(?i)bytespider", "Bytespider", None),
    (r"(?i)headlesschrome", "Headless Chrome", None),
    (r"(?i)phantomjs", "PhantomJS", None),
    (r"(?i)chrome-lighthouse|lighthouse", "Lighthouse", None),
    (r"(?i)^curl/", "curl", None),
    (r"(?i)^wget/", "Wget", None),
    (r"(?i)python-requests|python-urllib|aiohttp", "Python", None),
    (r"(?i)go-http-client", "Go HTTP Client", None),
    (r"(?i)bot|crawl|spider|scrape", "Unknown Bot", None),
];

static BOT_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| compile(BOT_PATTERNS));

const BROWSER_PATTERNS: &[Pattern] = &[
    (r"Edg(?:e|A|iOS)?/([\d.]+)", "Edge", None),
    (r"(?:OPR|Opera)/([\d.]+)", "Opera", None),
    (r"SamsungBrowser/([\d.]+)", "Samsung Internet", None),
    (r"Chromium/([\d.]+)", "Chromium", None),
    (r"(?:Chrome|CriOS)/([\d.]+)", "Chrome", None),
    (r"(?:Firefox|FxiOS)/([\d.]+)", "Firefox", None),
    (
        r"Version/([\d.]+).*Safari/",
        "Safari",
        Some(r"Chrome|Chromium|CriOS"),
    ),
    (r"MSIE ([\d.]+)", "Internet Explorer", None),
    (r"Trident/.*rv:([\d.]+)", "Internet Explorer", None),
];

static BROWSER_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| compile(BROWSER_PATTERNS));

const OS_PATTERNS: &[Pattern] = &[
    (r"Windows NT 10\.0", "Windows 10", None),
    (r"Windows NT 6\.3", "Windows 8.1", None),
    (r"Windows NT 6\.2", "Windows 8", None),
    (r"Windows NT 6\.1", "Windows 7", None),
    (r"Windows NT 6\.0", "Windows Vista", None),
    (r"Windows NT 5\.[12]", "Windows XP", None),
    (r"Windows", "Windows", None),
    (r"Macintosh", "macOS", None),
    (r"iPhone|iPod", "iOS", None),
    (r"iPad", "iPadOS", None),
    (r"Android", "Android", None),
    (r"Linux", "Linux", None),
    (r"CrOS", "Chrome OS", None),
];

static OS_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| compile(OS_PATTERNS));

const DEVICE_PATTERNS: &[(&str, DeviceType)] = &[
    (
        r"Mobi|iPhone|iPod|Windows Phone|IEMobile|BlackBerry|BB10|Opera Mini",
        DeviceType::Mobile,
    ),
    (r"iPad|Tablet|PlayBook|Silk|Kindle|Android", DeviceType::Tablet),
    (r"Windows NT|Macintosh|X11|CrOS|Linux", DeviceType::Desktop),
];

static DEVICE_RULES: LazyLock<Vec<(Regex, DeviceType)>> = LazyLock::new(|| {
    DEVICE_PATTERNS
        .iter()
        .map(|&(pattern, device)| (Regex::new(pattern).expect("static device pattern"), device))
        .collect()
});

/// Classify a raw user-agent string.
pub fn classify(ua: &str) -> ParsedUserAgent {
    let mut parsed = ParsedUserAgent {
        browser: UNKNOWN.into(),
        browser_version: UNKNOWN.into(),
        os: UNKNOWN.into(),
        is_bot: false,
        bot_name: None,
        device_type: DeviceType::Unknown,
        raw: ua.to_string(),
    };

    if ua.trim().is_empty() {
        return parsed;
    }

    if let Some((rule, _)) = first_match(&BOT_RULES, ua) {
        parsed.is_bot = true;
        parsed.bot_name = Some(rule.label.to_string());
        parsed.browser = rule.label.to_string();
        return parsed;
    }

    if let Some((rule, version)) = first_match(&BROWSER_RULES, ua) {
        parsed.browser = rule.label.to_string();
        if let Some(version) = version {
            parsed.browser_version = version;
        }
    }

    if let Some((rule, _)) = first_match(&OS_RULES, ua) {
        parsed.os = rule.label.to_string();
    }

    if let Some((_, device)) = DEVICE_RULES.iter().find(|(re, _)| re.is_match(ua)) {
        parsed.device_type = *device;
    }

    parsed
}
