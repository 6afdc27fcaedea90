use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use poolgate_provider_core::error::ProviderError;

type HmacSha256 = Hmac<Sha256>;

const AMZ_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");
const SHORT_DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

/// Header names that participate in the signature, in addition to `host`
/// and the `x-amz-*` headers the signer injects itself.
const SIGNABLE_HEADERS: &[&str] = &[
    "host",
    "content-type",
    "x-amz-date",
    "x-amz-security-token",
    "x-amz-content-sha256",
];

/// AWS Signature Version 4 request signer.
///
/// Signatures are time-based, so callers re-sign on every retry attempt.
pub(crate) struct SigV4Signer {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
    pub service: String,
}

impl SigV4Signer {
    /// Append `x-amz-date`, `host`, optional security token and the
    /// `Authorization` header for the given request.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &mut Vec<(String, String)>,
        payload: &[u8],
        now: OffsetDateTime,
    ) -> Result<(), ProviderError> {
        let (host, path, query) = split_url(url)?;
        let amz_date = now
            .format(AMZ_DATE_FORMAT)
            .map_err(|err| ProviderError::from_message(err.to_string()))?;
        let short_date = now
            .format(SHORT_DATE_FORMAT)
            .map_err(|err| ProviderError::from_message(err.to_string()))?;

        if !has_header(headers, "host") {
            headers.push(("host".to_string(), host.to_string()));
        }
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("x-amz-date"));
        headers.push(("x-amz-date".to_string(), amz_date.clone()));
        if let Some(token) = &self.session_token {
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case("x-amz-security-token"));
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let mut canonical_headers: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| {
                SIGNABLE_HEADERS
                    .iter()
                    .any(|signable| name.eq_ignore_ascii_case(signable))
            })
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        canonical_headers.sort();

        let signed_headers = canonical_headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_header_block: String = canonical_headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let payload_hash = hex::encode(Sha256::digest(payload));
        let canonical_request = format!(
            "{method}\n{path}\n{query}\n{canonical_header_block}\n{signed_headers}\n{payload_hash}",
            query = canonical_query(query),
        );

        let scope = format!(
            "{short_date}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.derive_key(&short_date)?;
        let signature = hex::encode(hmac(&signing_key, string_to_sign.as_bytes())?);

        headers.push((
            "Authorization".to_string(),
            format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.access_key_id
            ),
        ));
        Ok(())
    }

    fn derive_key(&self, short_date: &str) -> Result<Vec<u8>, ProviderError> {
        let secret = format!("AWS4{}", self.secret_access_key);
        let k_date = hmac(secret.as_bytes(), short_date.as_bytes())?;
        let k_region = hmac(&k_date, self.region.as_bytes())?;
        let k_service = hmac(&k_region, self.service.as_bytes())?;
        hmac(&k_service, b"aws4_request")
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| ProviderError::from_message(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(key, _)| key.eq_ignore_ascii_case(name))
}

fn split_url(url: &str) -> Result<(&str, &str, &str), ProviderError> {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ProviderError::invalid_config(format!("unsupported url: {url}")))?;
    let (host, rest) = match without_scheme.find('/') {
        Some(pos) => (&without_scheme[..pos], &without_scheme[pos..]),
        None => (without_scheme, "/"),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };
    Ok((host, path, query))
}

fn canonical_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (uri_encode(key), uri_encode(value)),
            None => (uri_encode(pair), String::new()),
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    // Vector from the AWS SigV4 reference suite (ListUsers against IAM).
    #[test]
    fn reference_signature_matches() {
        let signer = SigV4Signer {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
            region: "us-east-1".to_string(),
            service: "iam".to_string(),
        };
        let mut headers = vec![(
            "content-type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )];
        signer
            .sign(
                "GET",
                "https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08",
                &mut headers,
                b"",
                datetime!(2015-08-30 12:36:00 UTC),
            )
            .unwrap();

        let authorization = headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(authorization.contains(
            "Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request"
        ));
        assert!(authorization.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(authorization.ends_with(
            "Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        ));
    }

    #[test]
    fn session_token_is_signed_when_present() {
        let signer = SigV4Signer {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: Some("token123".to_string()),
            region: "us-west-2".to_string(),
            service: "bedrock".to_string(),
        };
        let mut headers = Vec::new();
        signer
            .sign(
                "POST",
                "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-3/invoke",
                &mut headers,
                br#"{"messages":[]}"#,
                datetime!(2026-01-15 08:00:00 UTC),
            )
            .unwrap();
        assert!(headers
            .iter()
            .any(|(name, value)| name == "x-amz-security-token" && value == "token123"));
        let authorization = headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(authorization.contains("x-amz-security-token"));
    }
}
