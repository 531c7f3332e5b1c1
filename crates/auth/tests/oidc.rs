use arkiv_auth::TokenValidator;
use http::HeaderMap;
use http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

const TEST_ISSUER: &str = "https://login.microsoftonline.test/tenant-id/v2.0";
const TEST_AUDIENCE: &str = "api://arkiv";

fn validator_with_audiences(audiences: &[&str]) -> TokenValidator {
    let jwks: JwkSet =
        serde_json::from_str(include_str!("fixtures/test_jwks.json")).expect("fixture JWKS parses");
    TokenValidator::from_parts(
        TEST_ISSUER,
        audiences.iter().map(|a| a.to_string()).collect(),
        jwks,
    )
    .expect("validator init should succeed")
}

fn validator() -> TokenValidator {
    validator_with_audiences(&[TEST_AUDIENCE])
}

fn mint_rs256(kid: &str, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(include_bytes!("fixtures/test_rsa_private.pem"))
            .expect("private key must parse"),
    )
    .expect("token encode should succeed")
}

fn auth_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {}", token)
            .parse()
            .expect("authorization header must parse"),
    );
    headers
}

fn valid_claims() -> serde_json::Value {
    serde_json::json!({
        "iss": TEST_ISSUER,
        "sub": "svc-sf-archive",
        "aud": TEST_AUDIENCE,
        "exp": 2000000000,
        "iat": 1000000000,
    })
}

#[tokio::test]
async fn valid_rs256_token_passes_validation() {
    let token = mint_rs256("test-kid", &valid_claims());
    validator()
        .validate_headers(&auth_headers(&token))
        .await
        .expect("validation should succeed");
}

#[tokio::test]
async fn any_configured_audience_is_accepted() {
    let validator = validator_with_audiences(&["api://other", TEST_AUDIENCE]);
    let token = mint_rs256("test-kid", &valid_claims());
    validator
        .validate_headers(&auth_headers(&token))
        .await
        .expect("validation should accept the second configured audience");
}

#[tokio::test]
async fn token_with_wrong_audience_is_rejected() {
    let mut claims = valid_claims();
    claims["aud"] = serde_json::json!("api://someone-else");
    let token = mint_rs256("test-kid", &claims);

    let err = validator()
        .validate_headers(&auth_headers(&token))
        .await
        .expect_err("wrong audience must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[tokio::test]
async fn token_from_unknown_issuer_is_rejected() {
    let mut claims = valid_claims();
    claims["iss"] = serde_json::json!("https://evil.example");
    let token = mint_rs256("test-kid", &claims);

    let err = validator()
        .validate_headers(&auth_headers(&token))
        .await
        .expect_err("unknown issuer must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let mut claims = valid_claims();
    claims["exp"] = serde_json::json!(1000000000);
    let token = mint_rs256("test-kid", &claims);

    let err = validator()
        .validate_headers(&auth_headers(&token))
        .await
        .expect_err("expired token must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[tokio::test]
async fn token_signed_with_unknown_kid_is_rejected() {
    let token = mint_rs256("rotated-kid", &valid_claims());

    let err = validator()
        .validate_headers(&auth_headers(&token))
        .await
        .expect_err("unknown kid must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[tokio::test]
async fn hs256_token_is_rejected() {
    let token = encode(
        &Header::new(Algorithm::HS256),
        &valid_claims(),
        &EncodingKey::from_secret(b"shared-secret"),
    )
    .expect("token encode should succeed");

    let err = validator()
        .validate_headers(&auth_headers(&token))
        .await
        .expect_err("HS256 token must fail");
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}

#[tokio::test]
async fn missing_authorization_header_is_rejected() {
    let err = validator()
        .validate_headers(&HeaderMap::new())
        .await
        .expect_err("missing header must fail");
    assert_eq!(err.code, "ERR_AUTH_REQUIRED");
}
