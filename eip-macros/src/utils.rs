use syn::punctuated::Punctuated;
use syn::{Ident, Path, Result as SynResult, Token, parse::Parse, parse::ParseStream};

// 键值参数：key = <Path>
pub(crate) struct KvPath {
    pub key: Ident,
    pub _eq: Token![=],
    pub value: Path,
}

impl Parse for KvPath {
    fn parse(input: ParseStream) -> SynResult<Self> {
        Ok(Self {
            key: input.parse()?,
            _eq: input.parse()?,
            value: input.parse()?,
        })
    }
}

// 解析逗号分隔的键值参数，拒绝未知与重复的键
pub(crate) fn parse_kv_pairs(input: ParseStream, allowed: &[&str]) -> SynResult<Vec<KvPath>> {
    if input.is_empty() {
        return Ok(Vec::new());
    }
    let pairs: Punctuated<KvPath, Token![,]> = Punctuated::parse_terminated(input)?;
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for kv in pairs.into_iter() {
        let key = kv.key.to_string();
        if !allowed.contains(&key.as_str()) {
            return Err(syn::Error::new(
                kv.key.span(),
                format!("unknown key in attribute; expected one of: {}", allowed.join(", ")),
            ));
        }
        if seen.contains(&key) {
            return Err(syn::Error::new(
                kv.key.span(),
                format!("duplicate key '{key}' in attribute"),
            ));
        }
        seen.push(key);
        out.push(kv);
    }
    Ok(out)
}

// snake_case 函数名转为 PascalCase 类型名
pub(crate) fn pascal_case(ident: &Ident) -> Ident {
    let raw = ident.to_string();
    let raw = raw.trim_start_matches("r#");
    let mut out = String::with_capacity(raw.len());
    let mut upper = true;
    for ch in raw.chars() {
        if ch == '_' {
            upper = true;
            continue;
        }
        if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    if out.is_empty() {
        out.push_str("Generated");
    }
    Ident::new(&out, ident.span())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proc_macro2::Span;

    #[test]
    fn converts_snake_case() {
        let id = Ident::new("add_audit_header", Span::call_site());
        assert_eq!(pascal_case(&id).to_string(), "AddAuditHeader");
        let id = Ident::new("_private", Span::call_site());
        assert_eq!(pascal_case(&id).to_string(), "Private");
    }
}
