//! XML tree round-trip laws.

use confab::xml::{Element, parse_document};

fn assert_round_trips(doc: &str) {
    let tree = parse_document(doc).unwrap_or_else(|e| panic!("parse {doc}: {e}"));
    let reparsed = parse_document(&tree.to_xml()).unwrap();
    assert_eq!(tree, reparsed, "round trip changed semantics for {doc}");
}

#[test]
fn parse_serialize_parse_is_identity() {
    for doc in [
        "<presence/>",
        "<message to=\"a@b\" type=\"chat\"><body>hi</body></message>",
        "<iq xmlns=\"jabber:client\" type=\"get\" id=\"1\">\
         <query xmlns=\"jabber:iq:roster\"/></iq>",
        "<x>before<y>inner</y>after</x>",
        "<m a=\"q&quot;q\">1 &lt; 2 &amp; 3 &gt; 2</m>",
        "<outer xmlns=\"ns:one\"><inner xmlns=\"ns:two\"><leaf/></inner></outer>",
        "<stream:features xmlns:stream=\"http://etherx.jabber.org/streams\">\
         <bind xmlns=\"urn:ietf:params:xml:ns:xmpp-bind\"/></stream:features>",
    ] {
        assert_round_trips(doc);
    }
}

#[test]
fn built_trees_round_trip() {
    let mut root = Element::new_with_ns("iq", "jabber:client");
    root.set_attrib("type", "set");
    root.set_attrib("id", "x1");
    let query = root.new_child("query");
    query.set_namespace("jabber:iq:roster");
    let item = query.new_child("item");
    item.set_attrib("jid", "juliet@example.net");
    item.set_attrib("name", "Juliet \"J\" Capulet");
    item.new_child("group").insert_data("Verona <3");

    let reparsed = parse_document(&root.to_xml()).unwrap();
    assert_eq!(root, reparsed);

    let item = reparsed
        .get_child("query")
        .and_then(|q| q.get_child("item"))
        .unwrap();
    assert_eq!(item.get_attrib("name"), Some("Juliet \"J\" Capulet"));
    assert_eq!(item.get_child("group").unwrap().get_data(), "Verona <3");
}

#[test]
fn formatted_output_reparses_equivalent_shape() {
    let doc = "<a><b><c>deep</c></b><d/></a>";
    let tree = parse_document(doc).unwrap();
    let pretty = tree.to_formatted_xml();
    assert!(pretty.contains("\n\t<b>"));
    assert!(pretty.contains("\n\t\t<c>deep</c>"));

    let reparsed = parse_document(&pretty).unwrap();
    // Shape survives: same elements in order, same text, ignoring the
    // indentation whitespace the pretty printer introduced.
    assert_eq!(
        reparsed.child_elements().map(|e| e.name.clone()).collect::<Vec<_>>(),
        ["b", "d"]
    );
    assert_eq!(
        reparsed
            .get_child("b")
            .and_then(|b| b.get_child("c"))
            .map(|c| c.get_data()),
        Some("deep".into())
    );
}

#[test]
fn malformed_documents_invalidate_whole_tree() {
    for doc in ["<a><b></a>", "<a", "", "text only", "<a></b>"] {
        assert!(parse_document(doc).is_err(), "{doc:?} should fail");
    }
}
