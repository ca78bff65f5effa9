//! `crypto`: random values and SHA-2 digests.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::Rng;
use rquickjs::{Ctx, Exception, Function};
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::from_factory;

/// Largest buffer `randomBytes`/`getRandomValues` will fill in one call.
const MAX_RANDOM_BYTES: f64 = 65_536.0;

/// Widest range `randomInt` accepts, as in Node.
const MAX_INT_RANGE: f64 = 281_474_976_710_655.0; // 2^48 - 1

const FACTORY: &str = r#"
(function (randomUUID, randomInt, randomBytes, hash) {
  return Object.freeze({
    randomUUID() {
      return randomUUID();
    },
    randomInt(min, max) {
      return max === undefined ? randomInt(0, min) : randomInt(min, max);
    },
    randomBytes(size) {
      return new Uint8Array(randomBytes(size));
    },
    getRandomValues(view) {
      const bytes = randomBytes(view.length);
      for (let i = 0; i < view.length; i++) view[i] = bytes[i];
      return view;
    },
    hash(algorithm, data, encoding) {
      const text = typeof data === "string" ? data : String(data);
      return hash(String(algorithm), text, encoding === undefined ? "hex" : String(encoding));
    },
  });
})
"#;

fn digest(algorithm: &str, data: &[u8]) -> Option<Vec<u8>> {
    match algorithm.to_ascii_lowercase().as_str() {
        "sha256" | "sha-256" => Some(Sha256::digest(data).to_vec()),
        "sha384" | "sha-384" => Some(Sha384::digest(data).to_vec()),
        "sha512" | "sha-512" => Some(Sha512::digest(data).to_vec()),
        _ => None,
    }
}

fn encode(encoding: &str, bytes: &[u8]) -> Option<String> {
    match encoding {
        "hex" => Some(hex::encode(bytes)),
        "base64" => Some(STANDARD.encode(bytes)),
        "base64url" => Some(URL_SAFE_NO_PAD.encode(bytes)),
        _ => None,
    }
}

pub(super) fn install<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let random_uuid = Function::new(ctx.clone(), || uuid::Uuid::new_v4().to_string())?;

    let random_int = Function::new(ctx.clone(), |ctx: Ctx<'js>, min: f64, max: f64| {
        let valid = min.is_finite()
            && max.is_finite()
            && min.fract() == 0.0
            && max.fract() == 0.0
            && min < max
            && max - min <= MAX_INT_RANGE;
        if !valid {
            return Err(Exception::throw_range(
                &ctx,
                "randomInt expects safe integers with min < max and a range below 2^48",
            ));
        }
        Ok(rand::thread_rng().gen_range(min as i64..max as i64) as f64)
    })?;

    let random_bytes = Function::new(ctx.clone(), |ctx: Ctx<'js>, size: f64| {
        if !size.is_finite() || size < 0.0 || size > MAX_RANDOM_BYTES {
            return Err(Exception::throw_range(
                &ctx,
                "random byte count must be between 0 and 65536",
            ));
        }
        let mut bytes = vec![0u8; size as usize];
        rand::thread_rng().fill(&mut bytes[..]);
        Ok(bytes.into_iter().map(i32::from).collect::<Vec<i32>>())
    })?;

    let hash = Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, algorithm: String, data: String, encoding: String| {
            let bytes = digest(&algorithm, data.as_bytes()).ok_or_else(|| {
                Exception::throw_message(&ctx, &format!("Digest method not supported: {}", algorithm))
            })?;
            encode(&encoding, &bytes).ok_or_else(|| {
                Exception::throw_type(&ctx, &format!("Unknown digest encoding: {}", encoding))
            })
        },
    )?;

    let crypto = from_factory(ctx, FACTORY, (random_uuid, random_int, random_bytes, hash))?;
    ctx.globals().set("crypto", crypto)
}
