//! DPoP proofs (RFC 9449)
//!
//! Every token request and every resource request carries a fresh ES256
//! proof signed by the key the tokens are bound to.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p256::SecretKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use sandbox_session::{DpopBinding, OAuthError, unix_now};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

#[derive(Debug, Serialize, Deserialize)]
pub struct DpopClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

/// A P-256 signing key for DPoP proofs.
#[derive(Clone)]
pub struct DpopKey {
    secret: SecretKey,
}

impl DpopKey {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, OAuthError> {
        let secret = SecretKey::from_pkcs8_der(der)
            .map_err(|e| OAuthError::Dpop(format!("invalid DPoP key: {}", e)))?;
        Ok(Self { secret })
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, OAuthError> {
        let document = self
            .secret
            .to_pkcs8_der()
            .map_err(|e| OAuthError::Dpop(format!("failed to encode DPoP key: {}", e)))?;
        Ok(document.as_bytes().to_vec())
    }

    /// Public half as a JWK.
    pub fn public_jwk(&self) -> Result<Jwk, OAuthError> {
        let point = self.secret.public_key().to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(OAuthError::Dpop("public key point is not uncompressed".into()));
        };

        Ok(Jwk {
            common: CommonParameters::default(),
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: URL_SAFE_NO_PAD.encode(x),
                y: URL_SAFE_NO_PAD.encode(y),
            }),
        })
    }

    /// Serialize this key and `nonce` for storage alongside a session.
    pub fn binding(&self, nonce: Option<String>) -> Result<DpopBinding, OAuthError> {
        let jwk = serde_json::to_string(&self.public_jwk()?)
            .map_err(|e| OAuthError::Dpop(e.to_string()))?;
        Ok(DpopBinding {
            pkcs8: self.to_pkcs8_der()?,
            jwk,
            nonce,
        })
    }

    pub fn from_binding(binding: &DpopBinding) -> Result<Self, OAuthError> {
        Self::from_pkcs8_der(&binding.pkcs8)
    }

    /// Sign a proof for `method` on `url`.
    pub fn proof(
        &self,
        method: &str,
        url: &Url,
        nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<String, OAuthError> {
        let claims = DpopClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            htm: method.to_uppercase(),
            htu: target_uri(url),
            iat: unix_now(),
            nonce: nonce.map(str::to_string),
            ath: access_token.map(access_token_hash),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some("dpop+jwt".to_string());
        header.jwk = Some(self.public_jwk()?);

        let key = EncodingKey::from_ec_der(&self.to_pkcs8_der()?);
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| OAuthError::Dpop(format!("failed to sign DPoP proof: {}", e)))
    }
}

/// `ath` claim: base64url SHA-256 of the access token.
pub fn access_token_hash(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

/// `htu` claim: the request URI without query and fragment.
pub fn target_uri(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    fn decode(proof: &str, key: &DpopKey) -> DpopClaims {
        let header = jsonwebtoken::decode_header(proof).unwrap();
        assert_eq!(header.typ.as_deref(), Some("dpop+jwt"));
        let jwk = header.jwk.expect("proof carries its public key");
        assert_eq!(jwk, key.public_jwk().unwrap());

        let decoding = DecodingKey::from_jwk(&jwk).unwrap();
        let mut validation = Validation::new(Algorithm::ES256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        jsonwebtoken::decode::<DpopClaims>(proof, &decoding, &validation)
            .unwrap()
            .claims
    }

    #[test]
    fn test_proof_verifies_against_embedded_key() {
        let key = DpopKey::generate();
        let url = Url::parse("https://pds.example.com/xrpc/app.bsky.actor.getProfile?actor=did:plc:abc#frag").unwrap();

        let proof = key.proof("get", &url, Some("nonce-1"), Some("token-abc")).unwrap();
        let claims = decode(&proof, &key);

        assert_eq!(claims.htm, "GET");
        assert_eq!(claims.htu, "https://pds.example.com/xrpc/app.bsky.actor.getProfile");
        assert_eq!(claims.nonce.as_deref(), Some("nonce-1"));
        assert_eq!(claims.ath, Some(access_token_hash("token-abc")));
        assert!(!claims.jti.is_empty());
    }

    #[test]
    fn test_proofs_are_unique() {
        let key = DpopKey::generate();
        let url = Url::parse("https://auth.example.com/oauth/token").unwrap();

        let a = decode(&key.proof("POST", &url, None, None).unwrap(), &key);
        let b = decode(&key.proof("POST", &url, None, None).unwrap(), &key);

        assert_ne!(a.jti, b.jti);
        assert!(a.ath.is_none());
        assert!(a.nonce.is_none());
    }

    #[test]
    fn test_pkcs8_round_trip_keeps_identity() {
        let key = DpopKey::generate();
        let binding = key.binding(Some("n".to_string())).unwrap();

        let restored = DpopKey::from_binding(&binding).unwrap();

        assert_eq!(restored.public_jwk().unwrap(), key.public_jwk().unwrap());
        assert!(binding.jwk.contains("\"crv\":\"P-256\""));
        assert_eq!(binding.nonce.as_deref(), Some("n"));
    }

    #[test]
    fn test_invalid_key_material() {
        assert!(DpopKey::from_pkcs8_der(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_access_token_hash_is_sha256() {
        // RFC 9449 appendix example token
        assert_eq!(
            access_token_hash("Kz~8mXK1EalYznwH-LC-1fBAo.4Ljp~zsPE_NeO.gxU"),
            "fUHyO2r2Z3DZ53EsNrWBb0xWXoaNy59IiKCAqksmQEo"
        );
    }
}
