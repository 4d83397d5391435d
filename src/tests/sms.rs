use crate::sms::is_valid_phone;

// Phone format validation. The store-backed send/verify flows (cooldown,
// hourly cap, atomic consume) are covered by the redis-gated integration
// tests in tests/store_redis_tests.rs.

#[test]
fn test_valid_mobile_numbers() {
    assert!(is_valid_phone("13900001111"));
    assert!(is_valid_phone("18612345678"));
    assert!(is_valid_phone("15011112222"));
}

#[test]
fn test_invalid_numbers_rejected() {
    assert!(!is_valid_phone("12345"), "Too short");
    assert!(!is_valid_phone("139000011112"), "Too long");
    assert!(!is_valid_phone("23900001111"), "Bad prefix");
    assert!(!is_valid_phone("12900001111"), "1[3-9] second digit required");
    assert!(!is_valid_phone("1390000111a"), "Digits only");
    assert!(!is_valid_phone(""), "Empty");
    assert!(!is_valid_phone("+8613900001111"), "No country prefix form");
}
