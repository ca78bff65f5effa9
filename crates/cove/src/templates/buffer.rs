//! `Buffer`: a `Uint8Array` subclass with Node-style encodings.
//!
//! The class itself is plain JS; byte conversion for each encoding happens
//! on the host side.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use rquickjs::{Ctx, Exception, Function};

use super::{from_factory, install_base64};

const FACTORY: &str = r#"
(function (encode, decode) {
  const normalize = (encoding) => (encoding === undefined ? "utf8" : String(encoding).toLowerCase());

  class Buffer extends Uint8Array {
    static from(value, encodingOrOffset, length) {
      if (typeof value === "string") {
        return new Buffer(encode(value, normalize(encodingOrOffset)));
      }
      if (value instanceof ArrayBuffer) {
        return new Buffer(value, encodingOrOffset || 0, length === undefined ? undefined : length);
      }
      if (ArrayBuffer.isView(value) || Array.isArray(value)) {
        const out = new Buffer(value.length);
        out.set(value);
        return out;
      }
      if (value && value.type === "Buffer" && Array.isArray(value.data)) {
        return Buffer.from(value.data);
      }
      throw new TypeError("The first argument must be a string, array, buffer or array-like object");
    }

    static alloc(size, fill) {
      const out = new Buffer(size);
      if (fill !== undefined) {
        out.fill(typeof fill === "number" ? fill : (encode(String(fill), "utf8")[0] || 0));
      }
      return out;
    }

    static byteLength(value, encoding) {
      return typeof value === "string" ? encode(value, normalize(encoding)).length : value.byteLength;
    }

    static concat(list, totalLength) {
      const total = totalLength === undefined ? list.reduce((n, b) => n + b.length, 0) : totalLength;
      const out = Buffer.alloc(total);
      let offset = 0;
      for (const chunk of list) {
        if (offset >= total) break;
        out.set(chunk.subarray(0, total - offset), offset);
        offset += chunk.length;
      }
      return out;
    }

    static isBuffer(value) {
      return value instanceof Buffer;
    }

    toString(encoding, start, end) {
      const view = this.subarray(start === undefined ? 0 : start, end === undefined ? this.length : end);
      return decode(Array.from(view), normalize(encoding));
    }

    equals(other) {
      if (this.length !== other.length) return false;
      for (let i = 0; i < this.length; i++) {
        if (this[i] !== other[i]) return false;
      }
      return true;
    }

    toJSON() {
      return { type: "Buffer", data: Array.from(this) };
    }
  }

  return Buffer;
})
"#;

/// Bytes of `value` in the given encoding, or `None` for an unknown one.
pub(super) fn encode_bytes(value: &str, encoding: &str) -> Option<Result<Vec<u8>, String>> {
    let bytes = match encoding {
        "utf8" | "utf-8" => Ok(value.as_bytes().to_vec()),
        "hex" => hex::decode(value).map_err(|e| format!("invalid hex string: {}", e)),
        "base64" | "base64url" => decode_base64(value),
        "latin1" | "binary" | "ascii" => Ok(value.chars().map(|c| u32::from(c) as u8).collect()),
        _ => return None,
    };
    Some(bytes)
}

/// Text for `bytes` in the given encoding, or `None` for an unknown one.
pub(super) fn decode_bytes(bytes: &[u8], encoding: &str) -> Option<String> {
    let text = match encoding {
        "utf8" | "utf-8" => String::from_utf8_lossy(bytes).into_owned(),
        "hex" => hex::encode(bytes),
        "base64" => STANDARD.encode(bytes),
        "base64url" => URL_SAFE_NO_PAD.encode(bytes),
        "latin1" | "binary" => bytes.iter().map(|&b| char::from(b)).collect(),
        "ascii" => bytes.iter().map(|&b| char::from(b & 0x7f)).collect(),
        _ => return None,
    };
    Some(text)
}

/// Lenient base64: standard or URL-safe alphabet, padding optional.
fn decode_base64(value: &str) -> Result<Vec<u8>, String> {
    let cleaned: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| STANDARD_NO_PAD.decode(&cleaned))
        .or_else(|_| URL_SAFE.decode(&cleaned))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&cleaned))
        .map_err(|e| format!("invalid base64 string: {}", e))
}

pub(super) fn install<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let encode = Function::new(ctx.clone(), |ctx: Ctx<'js>, value: String, encoding: String| {
        match encode_bytes(&value, &encoding) {
            Some(Ok(bytes)) => Ok(bytes.into_iter().map(i32::from).collect::<Vec<i32>>()),
            Some(Err(message)) => Err(Exception::throw_type(&ctx, &message)),
            None => Err(Exception::throw_type(&ctx, &format!("Unknown encoding: {}", encoding))),
        }
    })?;

    let decode = Function::new(ctx.clone(), |ctx: Ctx<'js>, bytes: Vec<i32>, encoding: String| {
        let bytes: Vec<u8> = bytes.into_iter().map(|b| b as u8).collect();
        decode_bytes(&bytes, &encoding)
            .ok_or_else(|| Exception::throw_type(&ctx, &format!("Unknown encoding: {}", encoding)))
    })?;

    let buffer = from_factory(ctx, FACTORY, (encode, decode))?;
    ctx.globals().set("Buffer", buffer)?;

    install_base64(ctx)
}
