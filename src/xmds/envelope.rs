// Request envelopes. The CMS is picky about the SOAP encoding attributes, so
// the template matches what reference players send byte for byte.

use super::XmdsMethod;

const ENVELOPE_OPEN: &str = concat!(
    r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:soapenc="http://schemas.xmlsoap.org/soap/encoding/" xmlns:tns="urn:xmds" "#,
    r#"xmlns:types="urn:xmds/encodedTypes" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema">"#,
    "\n",
    r#"  <soap:Body soap:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">"#,
    "\n"
);

const ENVELOPE_CLOSE: &str = "  </soap:Body>\n</soap:Envelope>";

/// One parameter of an XMDS call.
#[derive(Debug, Clone)]
pub struct Field<'a> {
    pub name: &'a str,
    pub xsd_type: &'a str,
    pub value: String,
}

impl<'a> Field<'a> {
    pub fn string(name: &'a str, value: impl Into<String>) -> Self {
        Self { name, xsd_type: "xsd:string", value: value.into() }
    }

    pub fn int(name: &'a str, value: impl std::fmt::Display) -> Self {
        Self { name, xsd_type: "xsd:int", value: value.to_string() }
    }

    pub fn base64(name: &'a str, value: impl Into<String>) -> Self {
        Self { name, xsd_type: "xsd:base64Binary", value: value.into() }
    }
}

/// Build the SOAP request body for `method`. Field values are escaped here,
/// so callers pass raw text (including raw XML documents such as log batches).
pub fn build(method: XmdsMethod, fields: &[Field<'_>]) -> String {
    let tag = method.element();
    let mut out = String::with_capacity(1024);
    out.push_str(ENVELOPE_OPEN);
    out.push_str(&format!("    <tns:{tag}>\n"));
    for f in fields {
        out.push_str(&format!(
            "      <{name} xsi:type=\"{ty}\">{value}</{name}>\n",
            name = f.name,
            ty = f.xsd_type,
            value = escape(&f.value),
        ));
    }
    out.push_str(&format!("    </tns:{tag}>\n"));
    out.push_str(ENVELOPE_CLOSE);
    out
}

/// XML text/attribute escaping.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_covers_markup() {
        assert_eq!(escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&apos;");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn envelope_wraps_fields_in_method_element() {
        let xml = build(
            XmdsMethod::RequiredFiles,
            &[Field::string("serverKey", "k&y"), Field::string("hardwareKey", "hw")],
        );
        assert!(xml.contains("<tns:RequiredFiles>"));
        assert!(xml.contains(r#"<serverKey xsi:type="xsd:string">k&amp;y</serverKey>"#));
        assert!(xml.contains(r#"<hardwareKey xsi:type="xsd:string">hw</hardwareKey>"#));
        assert!(xml.ends_with("</soap:Envelope>"));
    }
}
