/// Locales shipped under `locales/`, with their display names
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[("en", "English"), ("zh-CN", "简体中文")];

/// Switch status and CLI messages to the configured language, falling back to
/// the system locale and then English
pub fn set_language(configured: Option<&str>) {
    let lang = resolve_language(configured, std::env::var("LANG").ok().as_deref());
    rust_i18n::set_locale(lang);
    tracing::debug!("Message language: {}", lang);
}

fn resolve_language(configured: Option<&str>, system: Option<&str>) -> &'static str {
    configured
        .and_then(supported)
        .or_else(|| system.map(from_posix_locale))
        .unwrap_or("en")
}

fn supported(lang: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .map(|(code, _)| *code)
        .find(|code| code.eq_ignore_ascii_case(lang))
}

/// "zh_CN.UTF-8" -> "zh-CN"; anything we have no locale for is English
fn from_posix_locale(value: &str) -> &'static str {
    let tag = value.split('.').next().unwrap_or_default().replace('_', "-");
    supported(&tag)
        .or_else(|| tag.starts_with("zh").then_some("zh-CN"))
        .unwrap_or("en")
}
