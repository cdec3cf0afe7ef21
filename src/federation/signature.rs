//! HTTP Signatures
//!
//! draft-cavage signing for outbound deliveries and verification of
//! inbound inbox requests (rsa-sha256 over `(request-target) host date digest`).

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Maximum clock skew accepted on the Date header
const MAX_DATE_SKEW_SECS: i64 = 300;

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Signs outbound requests with one parsed private key
///
/// The PEM is decoded once so deliveries do not re-parse it per attempt.
#[derive(Clone)]
pub struct RequestSigner {
    key_id: String,
    signing_key: SigningKey<Sha256>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn from_pem(key_id: impl Into<String>, private_key_pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| AppError::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self {
            key_id: key_id.into(),
            signing_key: SigningKey::<Sha256>::new_unprefixed(private_key),
        })
    }

    /// Sign an HTTP request
    ///
    /// Returns the Signature, Date and (when a body is given) Digest headers.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<SignatureHeaders, AppError> {
        let parsed_url = url::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
        let host = host_header_value(&parsed_url)?;
        let path_and_query = match parsed_url.query() {
            Some(q) => format!("{}?{}", parsed_url.path(), q),
            None => parsed_url.path().to_string(),
        };

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let digest = body.map(generate_digest);

        let mut signing_parts = vec![
            format!(
                "(request-target): {} {}",
                method.to_lowercase(),
                path_and_query
            ),
            format!("host: {}", host),
            format!("date: {}", date),
        ];
        let mut headers_list = vec!["(request-target)", "host", "date"];

        if let Some(ref digest_value) = digest {
            signing_parts.push(format!("digest: {}", digest_value));
            headers_list.push("digest");
        }

        let signing_string = signing_parts.join("\n");
        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .sign_with_rng(&mut rng, signing_string.as_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            headers_list.join(" "),
            BASE64.encode(signature.to_bytes())
        );

        Ok(SignatureHeaders {
            signature: signature_header,
            date,
            digest,
        })
    }
}

/// One-shot signing with a PEM key.
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    RequestSigner::from_pem(key_id, private_key_pem)?.sign(method, url, body)
}

/// The Host header a client sends: the host plus any non-default port.
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Generate a fresh RSA key pair as (private PKCS#8 PEM, public SPKI PEM).
pub fn generate_key_pair(bits: usize) -> Result<(String, String), AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("RSA key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Private key encoding failed: {}", e)))?
        .to_string();
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Public key encoding failed: {}", e)))?;

    Ok((private_pem, public_pem))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// Verify an HTTP request signature
///
/// `path` is the request path including any query string.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body_data) = body {
        if header_str(headers, "digest")? != generate_digest(body_data) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" => {
                header_str(headers, header_name)?.to_string()
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;
    let verifier = VerifyingKey::<Sha256>::new_unprefixed(public_key);
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let actor = actor_id.split('#').next().unwrap_or(actor_id);
    key_actor == actor
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
/// A missing `algorithm` defaults to `hs2019`.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.ok_or_else(|| AppError::Validation("Missing headers".to_string()))?,
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// `SHA-256=base64(hash)` of a body
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    fn test_keypair() -> (String, String) {
        generate_key_pair(1024).expect("key generation should work")
    }

    fn signed_header_map(
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
    ) -> (HeaderMap, String) {
        let signer =
            RequestSigner::from_pem("https://remote.example/users/alice#main-key", private_key_pem)
                .expect("signer");
        let signed = signer.sign("POST", url, body).expect("signed");
        let parsed_url = url::Url::parse(url).expect("valid test url");
        let path = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "host",
            HeaderValue::from_str(&host_header_value(&parsed_url).unwrap()).unwrap(),
        );
        headers.insert("date", HeaderValue::from_str(&signed.date).unwrap());
        if let Some(digest) = signed.digest {
            headers.insert("digest", HeaderValue::from_str(&digest).unwrap());
        }
        headers.insert("signature", HeaderValue::from_str(&signed.signature).unwrap());

        (headers, path)
    }

    #[test]
    fn verify_accepts_valid_signed_request() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) =
            signed_header_map("https://relay.example/inbox?x=1", Some(body), &private_key_pem);

        let result = verify_signature("POST", &path, &headers, Some(body), &public_key_pem);
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn verify_includes_non_default_port_in_host() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let body = br#"{}"#;
        let (headers, path) =
            signed_header_map("http://127.0.0.1:8080/inbox", Some(body), &private_key_pem);

        assert_eq!(headers.get("host").unwrap(), "127.0.0.1:8080");
        assert!(verify_signature("POST", &path, &headers, Some(body), &public_key_pem).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let (headers, path) = signed_header_map(
            "https://relay.example/inbox",
            Some(br#"{"type":"Follow"}"#),
            &private_key_pem,
        );

        match verify_signature("POST", &path, &headers, Some(br#"{"type":"Undo"}"#), &public_key_pem)
        {
            Err(AppError::Validation(msg)) => assert_eq!(msg, "Digest mismatch"),
            other => panic!("expected digest mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_signature_from_another_key() {
        let (private_key_pem, _) = test_keypair();
        let (_, other_public_pem) = test_keypair();
        let body = br#"{}"#;
        let (headers, path) =
            signed_header_map("https://relay.example/inbox", Some(body), &private_key_pem);

        assert!(matches!(
            verify_signature("POST", &path, &headers, Some(body), &other_public_pem),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn verify_rejects_missing_date_header() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let body = br#"{}"#;
        let (mut headers, path) =
            signed_header_map("https://relay.example/inbox", Some(body), &private_key_pem);
        headers.remove("date");

        match verify_signature("POST", &path, &headers, Some(body), &public_key_pem) {
            Err(AppError::Validation(msg)) => assert!(msg.contains("Missing date header")),
            other => panic!("expected missing date error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_requires_date_among_signed_headers() {
        let (private_key_pem, public_key_pem) = test_keypair();
        let body = br#"{}"#;
        let (mut headers, path) =
            signed_header_map("https://relay.example/inbox", Some(body), &private_key_pem);

        let parsed =
            parse_signature_header(headers.get("signature").unwrap().to_str().unwrap()).unwrap();
        let tampered = format!(
            "keyId=\"{}\",algorithm=\"{}\",headers=\"(request-target) host digest\",signature=\"{}\"",
            parsed.key_id, parsed.algorithm, parsed.signature
        );
        headers.insert("signature", HeaderValue::from_str(&tampered).unwrap());

        match verify_signature("POST", &path, &headers, Some(body), &public_key_pem) {
            Err(AppError::Validation(msg)) => {
                assert!(msg.contains("Signed headers must include: date"))
            }
            other => panic!("expected missing signed date error, got: {other:?}"),
        }
    }

    #[test]
    fn parse_signature_header_defaults_algorithm() {
        let parsed = parse_signature_header(
            "keyId=\"https://a.example/actor#main-key\",headers=\"(request-target) Host Date\",signature=\"ZmFrZQ==\"",
        )
        .unwrap();
        assert_eq!(parsed.algorithm, "hs2019");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
    }

    #[test]
    fn key_id_matches_actor_compares_without_fragment() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
