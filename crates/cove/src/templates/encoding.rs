//! `TextEncoder`/`TextDecoder` (UTF-8 only) plus `atob`/`btoa`.

use rquickjs::{Ctx, Exception, Function};

use super::{from_factory, install_base64};

const FACTORY: &str = r#"
(function (encodeUtf8, decodeUtf8) {
  const bytesOf = (input) => {
    if (input === undefined) return [];
    if (input instanceof ArrayBuffer) return Array.from(new Uint8Array(input));
    if (ArrayBuffer.isView(input)) {
      return Array.from(new Uint8Array(input.buffer, input.byteOffset, input.byteLength));
    }
    throw new TypeError("The \"input\" argument must be an ArrayBuffer or ArrayBufferView");
  };

  class TextEncoder {
    get encoding() {
      return "utf-8";
    }
    encode(input) {
      return new Uint8Array(encodeUtf8(input === undefined ? "" : String(input)));
    }
    encodeInto(input, dest) {
      const bytes = encodeUtf8(String(input));
      const written = Math.min(bytes.length, dest.length);
      for (let i = 0; i < written; i++) dest[i] = bytes[i];
      return { read: String(input).length, written };
    }
  }

  class TextDecoder {
    #fatal;
    constructor(label, options) {
      const normalized = label === undefined ? "utf-8" : String(label).trim().toLowerCase();
      if (normalized !== "utf-8" && normalized !== "utf8" && normalized !== "unicode-1-1-utf-8") {
        throw new RangeError(`The "${label}" encoding is not supported`);
      }
      this.#fatal = Boolean(options && options.fatal);
    }
    get encoding() {
      return "utf-8";
    }
    get fatal() {
      return this.#fatal;
    }
    decode(input) {
      return decodeUtf8(bytesOf(input), this.#fatal);
    }
  }

  return { TextEncoder, TextDecoder };
})
"#;

/// Decode UTF-8, replacing invalid sequences unless `fatal`.
fn decode_utf8(bytes: &[u8], fatal: bool) -> Result<String, std::str::Utf8Error> {
    let text = if fatal {
        std::str::from_utf8(bytes)?.to_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };
    // A leading BOM is not part of the text.
    Ok(text.strip_prefix('\u{feff}').map(str::to_owned).unwrap_or(text))
}

pub(super) fn install<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let encode = Function::new(ctx.clone(), |text: String| {
        text.into_bytes().into_iter().map(i32::from).collect::<Vec<i32>>()
    })?;

    let decode = Function::new(ctx.clone(), |ctx: Ctx<'js>, bytes: Vec<i32>, fatal: bool| {
        let bytes: Vec<u8> = bytes.into_iter().map(|b| b as u8).collect();
        decode_utf8(&bytes, fatal)
            .map_err(|_| Exception::throw_type(&ctx, "The encoded data was not valid for encoding utf-8"))
    })?;

    let classes = from_factory(ctx, FACTORY, (encode, decode))?;
    let classes = classes
        .into_object()
        .ok_or_else(|| rquickjs::Error::new_from_js("value", "object"))?;
    let globals = ctx.globals();
    globals.set("TextEncoder", classes.get::<_, rquickjs::Value<'js>>("TextEncoder")?)?;
    globals.set("TextDecoder", classes.get::<_, rquickjs::Value<'js>>("TextDecoder")?)?;

    install_base64(ctx)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8() {
        assert_eq!(decode_utf8("héllo".as_bytes(), true).unwrap(), "héllo");
        assert_eq!(decode_utf8(&[0xef, 0xbb, 0xbf, b'a'], false).unwrap(), "a");
        assert_eq!(decode_utf8(&[0xff, b'a'], false).unwrap(), "\u{fffd}a");
        assert!(decode_utf8(&[0xff], true).is_err());
    }
}
