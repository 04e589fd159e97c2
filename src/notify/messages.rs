//! Subscriber-facing notification texts.

/// Subscription became active.
pub fn activated(days_left: i64) -> String {
    format!("Подписка активирована! Срок действия: {} дней", days_left)
}

/// Active subscription was extended.
pub fn extended(days_left: i64) -> String {
    format!("Подписка продлена! Новый срок: {} дней", days_left)
}

/// Subscription was cancelled.
pub fn cancelled() -> String {
    "Подписка отменена".to_string()
}

/// Auto-renew flag changed.
pub fn auto_renew(enabled: bool) -> String {
    if enabled {
        "Автопродление включено".to_string()
    } else {
        "Автопродление выключено".to_string()
    }
}

/// Subscription lapsed.
pub fn expired() -> String {
    "Ваша подписка истекла. Продлите для продолжения использования сервиса.".to_string()
}

/// Subscription ends within the reminder window.
pub fn expiring_soon(days_left: i64) -> String {
    format!(
        "Ваша подписка истекает через {} дней. Не забудьте продлить!",
        days_left
    )
}

/// Auto-renewal succeeded.
pub fn auto_renewed(days: i64) -> String {
    format!("Подписка автоматически продлена на {} дней", days)
}

/// Auto-renewal charge failed.
pub fn auto_renew_failed() -> String {
    "Ошибка автопродления подписки. Проверьте способ оплаты.".to_string()
}
