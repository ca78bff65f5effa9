//! `URL` and `URLSearchParams`.
//!
//! Parsing and serialization go through the `url` crate; the JS classes
//! hold the parsed components and re-parse on mutation.

use rquickjs::function::Opt;
use rquickjs::{Ctx, Exception, Function, Object};
use url::Url;

use super::from_factory;

const FACTORY: &str = r##"
(function (parse) {
  const LIST = Symbol("list");
  const UPDATE = Symbol("update");
  const PARTS = Symbol("parts");
  const PARAMS = Symbol("params");

  const encode = (s) =>
    encodeURIComponent(s)
      .replace(/%20/g, "+")
      .replace(/[!'()~]/g, (c) => "%" + c.charCodeAt(0).toString(16).toUpperCase());
  const decode = (s) => {
    try {
      return decodeURIComponent(s.replace(/\+/g, " "));
    } catch (_) {
      return s;
    }
  };

  class URLSearchParams {
    constructor(init) {
      this[LIST] = [];
      this[UPDATE] = null;
      if (init === undefined || init === null) return;
      if (typeof init === "string") {
        this[LIST] = URLSearchParams.parseQuery(init);
      } else if (typeof init[Symbol.iterator] === "function") {
        for (const pair of init) {
          const entry = Array.from(pair);
          if (entry.length !== 2) {
            throw new TypeError("Each query pair must be an iterable [name, value] tuple");
          }
          this[LIST].push([String(entry[0]), String(entry[1])]);
        }
      } else if (typeof init === "object") {
        for (const name of Object.keys(init)) this[LIST].push([name, String(init[name])]);
      } else {
        this[LIST] = URLSearchParams.parseQuery(String(init));
      }
    }

    static parseQuery(query) {
      const text = query.startsWith("?") ? query.slice(1) : query;
      const list = [];
      for (const piece of text.split("&")) {
        if (piece === "") continue;
        const eq = piece.indexOf("=");
        const name = eq < 0 ? piece : piece.slice(0, eq);
        const value = eq < 0 ? "" : piece.slice(eq + 1);
        list.push([decode(name), decode(value)]);
      }
      return list;
    }

    get size() {
      return this[LIST].length;
    }
    append(name, value) {
      this[LIST].push([String(name), String(value)]);
      this.changed();
    }
    delete(name, value) {
      const key = String(name);
      this[LIST] = this[LIST].filter(([n, v]) => !(n === key && (value === undefined || v === String(value))));
      this.changed();
    }
    get(name) {
      const found = this[LIST].find(([n]) => n === String(name));
      return found ? found[1] : null;
    }
    getAll(name) {
      return this[LIST].filter(([n]) => n === String(name)).map(([, v]) => v);
    }
    has(name, value) {
      const key = String(name);
      return this[LIST].some(([n, v]) => n === key && (value === undefined || v === String(value)));
    }
    set(name, value) {
      const key = String(name);
      const index = this[LIST].findIndex(([n]) => n === key);
      if (index < 0) {
        this[LIST].push([key, String(value)]);
      } else {
        this[LIST][index] = [key, String(value)];
        this[LIST] = this[LIST].filter(([n], i) => i <= index || n !== key);
      }
      this.changed();
    }
    sort() {
      this[LIST] = this[LIST]
        .map((pair, i) => [pair, i])
        .sort(([a, i], [b, j]) => (a[0] < b[0] ? -1 : a[0] > b[0] ? 1 : i - j))
        .map(([pair]) => pair);
      this.changed();
    }
    forEach(callback, thisArg) {
      for (const [name, value] of this[LIST]) callback.call(thisArg, value, name, this);
    }
    *entries() {
      for (const [name, value] of this[LIST]) yield [name, value];
    }
    *keys() {
      for (const [name] of this[LIST]) yield name;
    }
    *values() {
      for (const [, value] of this[LIST]) yield value;
    }
    [Symbol.iterator]() {
      return this.entries();
    }
    toString() {
      return this[LIST].map(([n, v]) => encode(n) + "=" + encode(v)).join("&");
    }
    changed() {
      if (this[UPDATE]) this[UPDATE](this.toString());
    }
  }

  const withoutQuery = (href) => href.split("#")[0].split("?")[0];

  class URL {
    constructor(input, base) {
      const parts = base === undefined ? parse(String(input)) : parse(String(input), String(base));
      this[PARTS] = parts;
      this[PARAMS] = new URLSearchParams(parts.search);
      this[PARAMS][UPDATE] = (query) => {
        this[PARTS] = parse(withoutQuery(this[PARTS].href) + (query ? "?" + query : "") + this[PARTS].hash);
      };
    }

    static canParse(input, base) {
      try {
        new URL(input, base);
        return true;
      } catch (_) {
        return false;
      }
    }

    get href() { return this[PARTS].href; }
    set href(value) {
      this[PARTS] = parse(String(value));
      this[PARAMS][LIST] = URLSearchParams.parseQuery(this[PARTS].search);
    }
    get origin() { return this[PARTS].origin; }
    get protocol() { return this[PARTS].protocol; }
    get username() { return this[PARTS].username; }
    get password() { return this[PARTS].password; }
    get host() { return this[PARTS].host; }
    get hostname() { return this[PARTS].hostname; }
    get port() { return this[PARTS].port; }
    get pathname() { return this[PARTS].pathname; }
    get search() { return this[PARTS].search; }
    set search(value) {
      const query = String(value).replace(/^\?/, "");
      this[PARTS] = parse(withoutQuery(this[PARTS].href) + (query ? "?" + query : "") + this[PARTS].hash);
      this[PARAMS][LIST] = URLSearchParams.parseQuery(this[PARTS].search);
    }
    get hash() { return this[PARTS].hash; }
    set hash(value) {
      const fragment = String(value).replace(/^#/, "");
      this[PARTS] = parse(this[PARTS].href.split("#")[0] + (fragment ? "#" + fragment : ""));
    }
    get searchParams() { return this[PARAMS]; }
    toString() { return this.href; }
    toJSON() { return this.href; }
  }

  return { URL, URLSearchParams };
})
"##;

/// WHATWG components of a parsed URL, serialized the way `URL` exposes them.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UrlParts {
    href: String,
    origin: String,
    protocol: String,
    username: String,
    password: String,
    host: String,
    hostname: String,
    port: String,
    pathname: String,
    search: String,
    hash: String,
}

fn prefixed(prefix: char, value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => format!("{}{}", prefix, v),
        _ => String::new(),
    }
}

fn parse_url(input: &str, base: Option<&str>) -> Option<UrlParts> {
    let base = match base {
        Some(base) => Some(Url::parse(base).ok()?),
        None => None,
    };
    let url = Url::options().base_url(base.as_ref()).parse(input).ok()?;

    let hostname = url.host_str().unwrap_or_default().to_owned();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{}:{}", hostname, port)
    };

    Some(UrlParts {
        href: url.as_str().to_owned(),
        origin: url.origin().ascii_serialization(),
        protocol: format!("{}:", url.scheme()),
        username: url.username().to_owned(),
        password: url.password().unwrap_or_default().to_owned(),
        host,
        hostname,
        port,
        pathname: url.path().to_owned(),
        search: prefixed('?', url.query()),
        hash: prefixed('#', url.fragment()),
    })
}

pub(super) fn install<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let parse = Function::new(ctx.clone(), |ctx: Ctx<'js>, input: String, base: Opt<String>| {
        let parts = parse_url(&input, base.0.as_deref())
            .ok_or_else(|| Exception::throw_type(&ctx, &format!("Invalid URL: {}", input)))?;

        let obj = Object::new(ctx.clone())?;
        obj.set("href", parts.href)?;
        obj.set("origin", parts.origin)?;
        obj.set("protocol", parts.protocol)?;
        obj.set("username", parts.username)?;
        obj.set("password", parts.password)?;
        obj.set("host", parts.host)?;
        obj.set("hostname", parts.hostname)?;
        obj.set("port", parts.port)?;
        obj.set("pathname", parts.pathname)?;
        obj.set("search", parts.search)?;
        obj.set("hash", parts.hash)?;
        Ok::<_, rquickjs::Error>(obj)
    })?;

    let classes = from_factory(ctx, FACTORY, (parse,))?;
    let classes = classes
        .into_object()
        .ok_or_else(|| rquickjs::Error::new_from_js("value", "object"))?;
    let globals = ctx.globals();
    globals.set("URL", classes.get::<_, rquickjs::Value<'js>>("URL")?)?;
    globals.set("URLSearchParams", classes.get::<_, rquickjs::Value<'js>>("URLSearchParams")?)?;
    Ok(())
}
