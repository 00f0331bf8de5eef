//! Security-focused token tests.
//!
//! These tests verify satellite token verification against common JWT attack
//! vectors: algorithm substitution, algorithm confusion, cross-audience replay,
//! forged and tampered signatures, hostile `kid` values, and malformed
//! structures. Every case must come back as a structured rejection.
#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use proptest::prelude::*;
use rstest::rstest;
use syfthub_authn::{
    KeyStore, TokenConfig, TokenService, assert_rejected,
    testutil::{
        TEST_ISSUER, craft_raw_jwt, sign_claims, test_key_store, test_rsa_key_secondary,
        test_token_service, valid_claims,
    },
    validation::validate_algorithm,
};

// ===========================================================================
// 1. Algorithm substitution: `alg: "none"` must be rejected
// ===========================================================================

#[test]
fn test_algorithm_none_rejected() {
    let service = test_token_service();
    let store = test_key_store("hub-1");

    let token = craft_raw_jwt(
        &serde_json::json!({"alg": "none", "typ": "JWT", "kid": "hub-1"}),
        &valid_claims("syftai-space"),
        "",
    );

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, InvalidTokenFormat);
}

#[rstest]
#[case::hs256("HS256")]
#[case::hs384("HS384")]
#[case::hs512("HS512")]
#[case::none("none")]
fn test_forbidden_algorithm_policy(#[case] alg: &str) {
    assert!(validate_algorithm(alg).is_err(), "{alg} must be rejected");
}

// ===========================================================================
// 2. Algorithm confusion: HS256 keyed with the public key material
// ===========================================================================

#[test]
fn test_hmac_signed_with_public_modulus_rejected() {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let public_n = store.get_jwks().unwrap().find("hub-1").unwrap().n.clone();

    // The attacker knows the public key and uses it as an HMAC secret,
    // hoping the verifier does the same.
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("hub-1".to_owned());
    let token = jsonwebtoken::encode(
        &header,
        &valid_claims("syftai-space"),
        &EncodingKey::from_secret(public_n.as_bytes()),
    )
    .unwrap();

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, InvalidTokenFormat);
}

// ===========================================================================
// 3. Cross-audience replay
// ===========================================================================

#[test]
fn test_token_for_one_audience_rejected_by_another() {
    let service = test_token_service();
    let store = test_key_store("hub-1");

    let token = service.create_token("42", "user", "partner-search", &store).unwrap();

    // The signature is valid; only the audience check stops the replay.
    assert!(service.verify_token_for_audience(&token, &store, "partner-search").is_ok());
    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, AudienceMismatch);
}

#[test]
fn test_audience_comparison_ignores_case_and_whitespace() {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let token = service.create_token("42", "user", "syftai-space", &store).unwrap();

    assert!(service.verify_token_for_audience(&token, &store, " SYFTAI-SPACE ").is_ok());
}

// ===========================================================================
// 4. Forged and tampered signatures
// ===========================================================================

#[test]
fn test_token_signed_by_other_key_under_known_kid() {
    let service = test_token_service();
    let verifier = test_key_store("hub-1");
    let attacker = KeyStore::with_signing_key("hub-1", test_rsa_key_secondary()).unwrap();

    let token = sign_claims(&attacker, Some("hub-1"), &valid_claims("syftai-space"));

    let result = service.verify_token_for_audience(&token, &verifier, "syftai-space");
    assert_rejected!(result, InvalidSignature);
}

#[test]
fn test_payload_swap_breaks_signature() {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let token = service.create_token("42", "user", "syftai-space", &store).unwrap();

    let mut claims = valid_claims("syftai-space");
    claims["role"] = "admin".into();
    let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());

    let parts: Vec<&str> = token.split('.').collect();
    let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

    let result = service.verify_token_for_audience(&forged, &store, "syftai-space");
    assert_rejected!(result, InvalidSignature);
}

#[test]
fn test_stripped_signature_rejected() {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let token = service.create_token("42", "user", "syftai-space", &store).unwrap();
    let stripped = format!("{}.", token.rsplit_once('.').unwrap().0);

    let result = service.verify_token_for_audience(&stripped, &store, "syftai-space");
    assert!(result.is_err(), "token without signature must not verify");
}

// ===========================================================================
// 5. Hostile kid values and missing claims
// ===========================================================================

#[rstest]
#[case::empty("")]
#[case::header_injection("hub-1\r\nx: y")]
#[case::nul("hub\01")]
fn test_hostile_kid_is_malformed(#[case] kid: &str) {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let token = sign_claims(&store, Some(kid), &valid_claims("syftai-space"));

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, InvalidTokenFormat);
}

#[rstest]
#[case::standard_base64_thumbprint("NzbLsXh8uDCcd+6MNwXF4W/7noWXFZAfHkxZsRGC9Xs=")]
#[case::path_traversal("../../etc/passwd")]
#[case::spaced("other issuer key")]
fn test_foreign_printable_kid_is_unknown_key(#[case] kid: &str) {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let token = sign_claims(&store, Some(kid), &valid_claims("syftai-space"));

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, UnknownKey);
}

#[test]
fn test_oversized_kid_is_malformed() {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let token = sign_claims(&store, Some(&"k".repeat(4096)), &valid_claims("syftai-space"));

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, InvalidTokenFormat);
}

#[rstest]
#[case::no_exp("exp")]
#[case::no_sub("sub")]
#[case::no_aud("aud")]
#[case::no_iss("iss")]
#[case::no_role("role")]
fn test_missing_claim_rejected(#[case] claim: &str) {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let mut claims = valid_claims("syftai-space");
    claims.as_object_mut().unwrap().remove(claim);
    let token = sign_claims(&store, Some("hub-1"), &claims);

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert!(result.is_err(), "token without '{claim}' must not verify");
}

#[test]
fn test_expiry_has_no_leeway() {
    let service = test_token_service();
    let store = test_key_store("hub-1");
    let mut claims = valid_claims("syftai-space");
    let now = Utc::now().timestamp();
    claims["iat"] = (now - 62).into();
    claims["exp"] = (now - 2).into();
    let token = sign_claims(&store, Some("hub-1"), &claims);

    let result = service.verify_token_for_audience(&token, &store, "syftai-space");
    assert_rejected!(result, TokenExpired);
}

// ===========================================================================
// 6. Malformed structures never panic
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_arbitrary_input_is_rejected_without_panic(input in ".{0,512}") {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        prop_assert!(service.verify_token_for_audience(&input, &store, "syftai-space").is_err());
    }

    #[test]
    fn prop_three_segment_garbage_is_rejected(
        a in "[A-Za-z0-9_-]{0,64}",
        b in "[A-Za-z0-9_-]{0,64}",
        c in "[A-Za-z0-9_-]{0,64}",
    ) {
        let service = test_token_service();
        let store = test_key_store("hub-1");
        let token = format!("{a}.{b}.{c}");
        prop_assert!(service.verify_token_for_audience(&token, &store, "syftai-space").is_err());
    }
}

// ===========================================================================
// 7. Token lifetime is exact
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_exp_minus_iat_equals_ttl(ttl in 1u64..86_400, sub in "[a-z0-9]{1,16}") {
        let service = TokenService::new(
            TokenConfig::builder()
                .issuer_url(TEST_ISSUER)
                .allowed_audiences(["syftai-space"])
                .ttl_seconds(ttl)
                .build()
                .unwrap(),
        );
        let store = test_key_store("hub-1");

        let token = service.create_token(&sub, "user", "syftai-space", &store).unwrap();
        let claims = service.verify_token_for_audience(&token, &store, "syftai-space").unwrap();

        prop_assert_eq!(claims.exp - claims.iat, ttl as i64);
        prop_assert_eq!(claims.sub, sub);
    }
}
