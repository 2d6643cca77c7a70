use std::sync::Arc;

use time::OffsetDateTime;

use crate::{
    adapters::NotificationDelivery,
    config::{self, CONFIG},
    db::{Db, QuietHoursRule},
};

use super::Event;

/// Plain token substitution: `{event}` plus `{key}` for every payload
/// field. Deliberately sandboxed; there is no lookup beyond the payload
/// map, no conditionals, no code.
pub fn render_template(
    template: &str,
    event_name: &str,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut out = template.replace("{event}", event_name);
    for (key, value) in payload {
        let needle = format!("{{{key}}}");
        if !out.contains(&needle) {
            continue;
        }
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            rest => rest.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

/// Plain-text fallback used when no template exists or rendering is not
/// possible. A notification is never dropped for formatting reasons.
fn fallback_body(event_name: &str, payload: &serde_json::Map<String, serde_json::Value>) -> String {
    format!(
        "{event_name}: {}",
        serde_json::Value::Object(payload.clone())
    )
}

/// Quiet-hours check. Windows where `start > end` wrap across midnight;
/// the day-of-week filter applies to the day the window starts.
pub fn is_suppressed(rules: &[QuietHoursRule], event_name: &str, now: OffsetDateTime) -> bool {
    let minute = (now.hour() as i64) * 60 + now.minute() as i64;
    let today = now.weekday().number_days_from_monday() as i64;
    let yesterday = (today + 6) % 7;
    for rule in rules.iter().filter(|r| r.enabled) {
        let exceptions: Vec<String> =
            serde_json::from_str(&rule.exception_events).unwrap_or_default();
        if exceptions.iter().any(|e| e == event_name) {
            continue;
        }
        let days: Vec<i64> = serde_json::from_str(&rule.days_of_week).unwrap_or_default();
        let active = if rule.start_minute <= rule.end_minute {
            minute >= rule.start_minute && minute < rule.end_minute && days.contains(&today)
        } else {
            (minute >= rule.start_minute && days.contains(&today))
                || (minute < rule.end_minute && days.contains(&yesterday))
        };
        if active {
            return true;
        }
    }
    false
}

pub async fn dispatch(db: &Db, deliveries: &[Arc<dyn NotificationDelivery>], event: &Event) {
    if deliveries.is_empty() {
        return;
    }
    let services: config::NotificationServices = CONFIG.get_value();
    let rules = match db.list_quiet_hours().await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::error!("Failed to load quiet hours: {e}");
            Vec::new()
        }
    };
    let suppressed = is_suppressed(&rules, event.name(), OffsetDateTime::now_utc());
    let payload = event.payload();

    for delivery in deliveries {
        let service = delivery.service_name();
        let Some(service_url) = services.0.get(service) else {
            continue;
        };
        let (title, body) = match db.find_notification_template(service, event.name()).await {
            Ok(Some(template)) => (
                render_template(&template.title_template, event.name(), &payload),
                render_template(&template.body_template, event.name(), &payload),
            ),
            Ok(None) => (event.name().to_string(), fallback_body(event.name(), &payload)),
            Err(e) => {
                tracing::debug!("Template lookup failed, using fallback: {e}");
                (event.name().to_string(), fallback_body(event.name(), &payload))
            }
        };

        if suppressed {
            let _ = db
                .record_notification(service, event.name(), &title, &body, true, None)
                .await;
            continue;
        }

        let error = delivery
            .send(service_url, &title, &body)
            .await
            .err()
            .map(|e| e.to_string());
        if let Some(error) = &error {
            tracing::warn!(service, "Notification delivery failed: {error}");
        }
        if let Err(e) = db
            .record_notification(service, event.name(), &title, &body, false, error.as_deref())
            .await
        {
            tracing::error!("Failed to record notification: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn rule(start: i64, end: i64, days: &str, exceptions: &str) -> QuietHoursRule {
        QuietHoursRule {
            id: 1,
            name: "night".into(),
            start_minute: start,
            end_minute: end,
            days_of_week: days.into(),
            exception_events: exceptions.into(),
            enabled: true,
        }
    }

    #[test]
    fn template_substitutes_known_tokens_only() {
        let mut payload = serde_json::Map::new();
        payload.insert("provider".into(), "opensubtitles".into());
        payload.insert("score".into(), 75.into());
        let rendered = render_template(
            "[{event}] {provider} scored {score} {unknown}",
            "subtitle_downloaded",
            &payload,
        );
        assert_eq!(
            rendered,
            "[subtitle_downloaded] opensubtitles scored 75 {unknown}"
        );
    }

    #[test]
    fn quiet_window_suppresses_inside_only() {
        // 22:00 - 07:00 every day
        let rules = vec![rule(1320, 420, "[0,1,2,3,4,5,6]", "[]")];
        // Tuesday 23:30
        assert!(is_suppressed(&rules, "subtitle_downloaded", datetime!(2026-01-06 23:30 UTC)));
        // Wednesday 03:00, window started Tuesday
        assert!(is_suppressed(&rules, "subtitle_downloaded", datetime!(2026-01-07 03:00 UTC)));
        // Tuesday noon
        assert!(!is_suppressed(&rules, "subtitle_downloaded", datetime!(2026-01-06 12:00 UTC)));
    }

    #[test]
    fn exception_events_pass_through() {
        let rules = vec![rule(0, 1440, "[0,1,2,3,4,5,6]", r#"["error"]"#)];
        assert!(is_suppressed(&rules, "subtitle_downloaded", datetime!(2026-01-06 12:00 UTC)));
        assert!(!is_suppressed(&rules, "error", datetime!(2026-01-06 12:00 UTC)));
    }

    #[test]
    fn day_filter_applies_to_window_start_day() {
        // Friday night only (weekday 4), 23:00 - 02:00
        let rules = vec![rule(1380, 120, "[4]", "[]")];
        // Saturday 01:00: window started Friday
        assert!(is_suppressed(&rules, "x", datetime!(2026-01-10 01:00 UTC)));
        // Sunday 01:00: window started Saturday, not covered
        assert!(!is_suppressed(&rules, "x", datetime!(2026-01-11 01:00 UTC)));
    }
}
