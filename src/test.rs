use rstest::rstest;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use crate::cell::STRING_SIZE;
use crate::oper::{self, OperFn, OperOut};
use crate::source::{self, Source};
use crate::value::Value;
use crate::*;

/// Tests share the process-wide registries, so they are initialized once
/// and never torn down: the built-in types, the identifier extension,
/// and a constants object used by the substitution tests.
fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        types::init(flag::STRICT);
        ident::register();

        let mut stack = Stack::new(1);
        stack.open_collection(JsonType::Object);
        stack.add_member_uint("NONE", 0).unwrap();
        stack.add_member_uint("BIT0", 1).unwrap();
        stack.close_collection();
        stack::set_constants(stack.get_document());
    });
}

fn parse(json: &str) -> Document {
    Document::parse_with_flags(json, flag::STRICT).unwrap()
}

/// Walk a document checking the span invariants: every size matches the
/// cell subspan it covers, collection lengths match their children, and
/// member names carry the key flag.
fn check_spans(value: &Value) {
    assert_eq!(value.size() as usize, value.cells().len());

    match value.json_type() {
        Some(JsonType::Array) => {
            assert_eq!(value.iter_elements().count(), value.len());

            for element in value.iter_elements() {
                check_spans(element);
            }
        }
        Some(JsonType::Object) => {
            assert_eq!(value.iter_members().count(), value.len());

            for (name, member) in value.iter_members() {
                assert!(name.cells()[0].has_flag(flag::IS_KEY));
                check_spans(member);
            }
        }
        _ => {}
    }
}

// ----------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------

#[test]
fn parse_short_string() {
    init();
    let doc = parse("\"ABC\"");
    assert_eq!(doc.get_type(), JsonType::String as u16);
    assert_eq!(doc.json_type(), Some(JsonType::String));
    assert_eq!(doc.cells().len(), 1);
    assert_eq!(doc.size(), 1);
    assert_eq!(doc.len(), 3);
    assert_eq!(doc.get_string(), "ABC");
    assert_eq!(&doc.cells()[0].str_fragment()[..4], b"ABC\0");
}

#[test]
fn parse_object_with_nested_array() {
    init();
    let doc = parse(r#"{"a":1,"b":[true,null]}"#);
    assert_eq!(doc.json_type(), Some(JsonType::Object));
    assert_eq!(doc.len(), 2);
    assert_eq!(doc.cells().len(), 7);
    assert_eq!(doc.size(), 7);

    assert!(doc.cells()[0].has_flag(flag::ALLOCED));
    assert!(doc.cells()[1..].iter().all(|cell| !cell.has_flag(flag::ALLOCED)));
    assert!(doc.cells()[1].has_flag(flag::IS_KEY));

    assert_eq!(doc.member("a").unwrap().get_uint(), 1);
    let b = doc.member("b").unwrap();
    assert_eq!(b.json_type(), Some(JsonType::Array));
    assert_eq!(b.len(), 2);
    assert!(b.element(0).unwrap().get_bool());
    assert_eq!(b.element(1).unwrap().json_type(), Some(JsonType::Null));
    assert!(b.element(2).is_none());
    assert!(doc.member("missing").is_none());

    check_spans(&doc);
}

#[test]
fn parse_unicode_escape() {
    init();
    let doc = parse(r#""\u00e9""#);
    assert_eq!(doc.size(), 1);
    assert_eq!(doc.len(), 2);
    assert_eq!(&doc.cells()[0].str_fragment()[..3], &[0xc3, 0xa9, 0x00]);
    assert_eq!(doc.get_string(), "\u{e9}");
}

#[rstest]
#[case::fits_inline("1234567", 1)]
#[case::nul_spills_over("12345678", 2)]
#[case::fills_two_cells("12345678901234567890123", 2)]
#[case::starts_a_third("123456789012345678901234", 3)]
fn string_span_sizes(#[case] text: &str, #[case] cells: u32) {
    init();
    let doc = parse(&format!("\"{text}\""));
    assert_eq!(doc.size(), cells);
    assert_eq!(doc.cells().len(), cells as usize);
    assert_eq!(doc.len(), text.len());
    assert_eq!(doc.get_string(), text);
}

#[test]
fn string_continuations_are_nul_terminated() {
    init();
    let doc = parse("\"12345678\"");
    assert_eq!(doc.cells()[1].chunk()[0], 0);

    let doc = parse("\"12345678901234567890123\"");
    assert_eq!(doc.cells()[1].chunk()[15], 0);
}

#[test]
fn parse_escapes() {
    init();
    let doc = parse(r#""a\"b\\c\/d\b\f\n\r\te""#);
    assert_eq!(doc.get_string(), "a\"b\\c/d\u{8}\u{c}\n\r\te");
}

#[rstest]
#[case::empty("", Error::NoData)]
#[case::blank("  \t\n ", Error::NoData)]
#[case::bad_escape(r#""\q""#, Error::BadEscape(3))]
#[case::bad_hex(r#""\u12G4""#, Error::BadEscape(6))]
#[case::surrogate_half(r#""\ud800""#, Error::BadEscape(7))]
#[case::unterminated("\"abc", Error::Invalid(4))]
#[case::bare_symbol("@", Error::Invalid(1))]
#[case::unknown_word("nil", Error::Invalid(3))]
#[case::missing_colon(r#"{"a" 1}"#, Error::Invalid(6))]
#[case::missing_close(r#"{"a":1"#, Error::Invalid(6))]
#[case::bad_member("{1:2}", Error::Invalid(2))]
#[case::unclosed_array("[1,2", Error::Invalid(4))]
#[case::dangling_minus("-", Error::Invalid(1))]
#[case::bare_fraction("1.", Error::Invalid(2))]
#[case::empty_exponent("1e+", Error::Invalid(3))]
fn parse_errors(#[case] json: &str, #[case] expected: Error) {
    init();
    assert_eq!(Document::parse_with_flags(json, flag::STRICT).unwrap_err(), expected);
}

#[rstest]
#[case("0", 0)]
#[case("123", 123)]
#[case("18446744073709551615", u64::MAX)]
fn parse_unsigned_integers(#[case] json: &str, #[case] expected: u64) {
    init();
    let doc = parse(json);
    assert!(doc.cells()[0].has_flag(flag::IS_UINT));
    assert_eq!(doc.get_uint(), expected);
    assert_eq!(doc.get_number(), expected as f64);
}

#[rstest]
#[case("3.5", 3.5)]
#[case("-1", -1.0)]
#[case("1e3", 1000.0)]
#[case("-2.5e-1", -0.25)]
#[case("18446744073709551616", 18446744073709551616.0)] // too big for u64
fn parse_doubles(#[case] json: &str, #[case] expected: f64) {
    init();
    let doc = parse(json);
    assert!(!doc.cells()[0].has_flag(flag::IS_UINT));
    assert_eq!(doc.get_number(), expected);
}

#[test]
fn parse_hex_numbers() {
    init();
    let doc = Document::parse_with_flags("0x1F", flag::ALLOW_HEX).unwrap();
    assert!(doc.cells()[0].has_flag(flag::IS_UINT));
    assert_eq!(doc.get_uint(), 31);

    // A hex literal too wide for u64 widens to a double.
    let doc = Document::parse_with_flags("0x10000000000000000", flag::ALLOW_HEX).unwrap();
    assert!(!doc.cells()[0].has_flag(flag::IS_UINT));
    assert_eq!(doc.get_number(), 18446744073709551616.0);

    assert_eq!(
        Document::parse_with_flags("0x", flag::ALLOW_HEX).unwrap_err(),
        Error::Invalid(2)
    );

    // Without the flag the digits stop at the 'x'.
    let mut stack = Stack::new(0);
    let mut source = Source::with_flags("0x1F", flag::STRICT);
    stack.load_json(&mut source).unwrap();
    assert_eq!(source.consumed(), 1);
    assert_eq!(stack.get_document().get_uint(), 0);
}

#[rstest]
#[case::object("{}", JsonType::Object)]
#[case::array("[]", JsonType::Array)]
#[case::spaced(" [ ] ", JsonType::Array)]
fn empty_collections_are_one_cell(#[case] json: &str, #[case] ty: JsonType) {
    init();
    let doc = parse(json);
    assert_eq!(doc.json_type(), Some(ty));
    assert_eq!(doc.len(), 0);
    assert!(doc.is_empty());
    assert_eq!(doc.size(), 1);
    assert_eq!(doc.cells().len(), 1);

    match ty {
        JsonType::Array => assert!(doc.element(0).is_none()),
        _ => assert!(doc.member("anything").is_none()),
    }
}

#[test]
fn parse_json_returns_the_remainder() -> anyhow::Result<()> {
    init();
    let mut stack = Stack::new(1);
    let rest = stack.parse_json("{\"a\": 1} trailing")?;
    assert_eq!(rest, " trailing");
    assert_eq!(stack.get_document().member("a").unwrap().get_uint(), 1);
    Ok(())
}

#[test]
fn error_rolls_back_the_stack() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Array);
    stack.add_uint(1);
    let before = stack.count();

    let mut source = Source::with_flags("[2, oops]", flag::STRICT);
    assert!(matches!(stack.load_json(&mut source), Err(Error::Invalid(_))));
    assert_eq!(stack.count(), before); // partial parse discarded

    stack.add_uint(2);
    stack.close_collection();
    assert!(stack.get_document().value_eq(&parse("[1,2]")));

    stack.open_collection(JsonType::Object);
    stack.clear();
    assert_eq!(stack.count(), 0);
}

#[test]
fn deep_nesting_keeps_spans_consistent() {
    init();
    let doc = parse(
        r#"{"a":[1,[2,[3,[4]]]],"long":"a string that spans multiple cells for sure","o":{"x":{"y":[true,false,null]}}}"#,
    );
    check_spans(&doc);
    assert_eq!(
        doc.member("o").unwrap().member("x").unwrap().member("y").unwrap().len(),
        3
    );
}

// ----------------------------------------------------------------------
// Indexing
// ----------------------------------------------------------------------

#[test]
fn indexing_is_idempotent() {
    init();
    let doc = parse(r#"[1,[2,3],"a string longer than seven bytes",4]"#);
    assert!(!doc.is_indexed());

    let first: &Value = doc.element(3).unwrap();
    assert!(doc.is_indexed());
    assert_eq!(first.get_uint(), 4);

    // Re-access returns the identical span and mutates nothing.
    assert!(std::ptr::eq(first, doc.element(3).unwrap()));
    assert_eq!(doc.size() as usize, doc.cells().len());
    check_spans(&doc);
}

#[test]
fn member_lookup_uses_the_published_index() {
    init();
    let doc = parse(r#"{"alpha":1,"beta":2,"gamma":3,"delta":4,"epsilon":5}"#);
    assert!(!doc.is_indexed());

    for (name, expected) in [("alpha", 1), ("beta", 2), ("gamma", 3), ("delta", 4), ("epsilon", 5)]
    {
        assert_eq!(doc.member(name).unwrap().get_uint(), expected);
    }

    assert!(doc.is_indexed());
    assert!(doc.member("zeta").is_none());
    assert!(std::ptr::eq(doc.member("gamma").unwrap(), doc.member("gamma").unwrap()));
}

#[test]
fn duplicate_member_names_find_the_last() {
    init();
    let doc = parse(r#"{"k":1,"k":2}"#);
    assert_eq!(doc.member("k").unwrap().get_uint(), 2);
}

// ----------------------------------------------------------------------
// Serialization and equivalence
// ----------------------------------------------------------------------

#[rstest]
#[case(r#"{"a":1,"b":[true,null],"c":"x"}"#)]
#[case(r#"[[],{},[[[1]]],"nested \"quotes\" and \\ slashes"]"#)]
#[case(r#"{"n":-1.25e2,"u":18446744073709551615,"s":"0123456789abcdef0123456789"}"#)]
fn round_trip_preserves_value(#[case] input: &str) -> anyhow::Result<()> {
    init();
    let doc = Document::parse_with_flags(input, flag::STRICT)?;
    let text = doc.to_json();
    let again = Document::parse_with_flags(&text, flag::STRICT)?;
    assert!(doc.value_eq(&again), "{input} -> {text}");

    // The output must be interchange-grade JSON.
    serde_json::from_str::<serde_json::Value>(&text)?;
    Ok(())
}

#[test]
fn serialize_compact_json() {
    init();
    let doc = parse(r#" { "a" : 1 , "b" : [ true , null ] } "#);
    insta::assert_snapshot!(doc.to_json(), @r#"{"a":1,"b":[true,null]}"#);
    assert_eq!(format!("{doc}"), doc.to_json());
}

#[test]
fn serialize_escapes_controls_and_quotes() {
    init();
    let doc = parse(r#""\t\"x\\""#);
    insta::assert_snapshot!(doc.to_json(), @r#""\t\"x\\""#);
}

#[rstest]
#[case("1.5", "1.5")]
#[case("1e3", "1000")]
#[case("0.25", "0.25")]
#[case("123", "123")]
#[case("-7", "-7")]
fn serialize_numbers(#[case] input: &str, #[case] expected: &str) {
    init();
    assert_eq!(parse(input).to_json(), expected);
}

#[test]
fn serde_serializes_the_json_value() -> anyhow::Result<()> {
    init();
    let doc = parse(r#"{"a":1,"b":[true,null],"c":2.5,"s":"x"}"#);
    assert_eq!(
        serde_json::to_string(&doc)?,
        r#"{"a":1,"b":[true,null],"c":2.5,"s":"x"}"#
    );
    Ok(())
}

#[test]
fn value_equivalence() {
    init();
    assert!(parse(r#"{"a":1,"b":2}"#).value_eq(&parse(r#"{"b":2,"a":1}"#)));
    assert!(parse("[1]").value_eq(&parse("[1.0]"))); // numbers compare as doubles
    assert!(!parse(r#"{"a":1}"#).value_eq(&parse(r#"{"a":2}"#)));
    assert!(!parse(r#"{"a":1}"#).value_eq(&parse(r#"{"b":1}"#)));
    assert!(!parse("[1,2]").value_eq(&parse("[2,1]")));
    assert!(!parse("\"a\"").value_eq(&parse("\"b\"")));
    assert!(!parse("null").value_eq(&parse("false")));
    assert!(!parse(r#"{"a":1}"#).value_eq(&parse("[1]")));
}

#[rstest]
#[case("null", false)]
#[case("false", false)]
#[case("true", true)]
#[case("0", false)]
#[case("0.0", false)]
#[case("3", true)]
#[case("\"\"", false)]
#[case("\"x\"", true)]
#[case("[]", false)]
#[case("[0]", true)]
#[case("{}", false)]
#[case(r#"{"a":null}"#, true)]
fn boolean_coercion(#[case] json: &str, #[case] expected: bool) {
    init();
    assert_eq!(parse(json).test(), expected);
}

// ----------------------------------------------------------------------
// References and cloning
// ----------------------------------------------------------------------

#[test]
fn references_are_transparent() {
    init();
    let target = parse(r#"{"n":7,"s":"a string well over seven bytes"}"#);
    let reference = unsafe { Document::reference(&target) };

    assert_eq!(reference.size(), 1); // a reference is its own one-cell span
    assert_eq!(reference.get_type(), JsonType::Object as u16);
    assert_eq!(reference.len(), target.len());
    assert_eq!(reference.member("n").unwrap().get_uint(), 7);
    assert_eq!(
        reference.member("s").unwrap().get_string(),
        target.member("s").unwrap().get_string()
    );
    assert!(reference.test());
    assert_eq!(reference.to_json(), target.to_json());
    assert!(reference.value_eq(&target));
}

#[test]
fn duplicate_is_deep() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Array);
    stack.add_string_owned(String::from("an owned string referent")).unwrap();
    stack.add_string("a copied string that spans cells").unwrap();
    stack.close_collection();
    let original = stack.get_document();

    let copy = original.duplicate();
    assert!(copy.value_eq(&original));
    assert!(copy.cells()[0].has_flag(flag::ALLOCED));

    drop(original);
    assert_eq!(copy.element(0).unwrap().get_string(), "an owned string referent");
    assert_eq!(copy.element(1).unwrap().get_string(), "a copied string that spans cells");

    let clone = copy.clone();
    assert!(clone.value_eq(&copy));
}

// ----------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------

#[test]
fn build_a_document() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Object);
    stack.add_member_uint("a", 1).unwrap();
    stack.add_member_name("b").unwrap();
    stack.open_collection(JsonType::Array);
    stack.add_bool(true);
    stack.add_null();
    stack.close_collection();
    stack.close_collection();

    let built = stack.get_document();
    assert_eq!(built.cells().len(), 7);
    assert!(built.value_eq(&parse(r#"{"a":1,"b":[true,null]}"#)));
    check_spans(&built);
}

#[test]
fn build_with_every_member_kind() {
    init();
    let other = parse("[10,20]");

    let mut stack = Stack::new(1);
    stack.open_collection(JsonType::Object);
    stack.add_member_null("n").unwrap();
    stack.add_member_bool("b", true).unwrap();
    stack.add_member_number("f", 2.5).unwrap();
    stack.add_member_string("s", "text").unwrap();
    stack.add_member_dup("d", &other).unwrap();
    stack.add_member_name_ref("r").unwrap();
    stack.add_string_ref("a static string constant").unwrap();
    stack.close_collection();

    let doc = stack.get_document();
    assert_eq!(doc.len(), 6);
    assert_eq!(doc.member("n").unwrap().json_type(), Some(JsonType::Null));
    assert_eq!(doc.member("f").unwrap().get_number(), 2.5);
    assert_eq!(doc.member("s").unwrap().get_string(), "text");
    assert_eq!(doc.member("d").unwrap().element(1).unwrap().get_uint(), 20);
    assert_eq!(doc.member("r").unwrap().get_string(), "a static string constant");
    check_spans(&doc);
}

#[test]
fn build_string_kinds() {
    init();
    let mut stack = Stack::new(1);
    stack.open_collection(JsonType::Array);
    stack.add_string("a copied string that is long enough to span").unwrap();
    stack.add_string_ref("static").unwrap();
    stack.add_string_owned(String::from("owned")).unwrap();
    stack.close_collection();

    let doc = stack.get_document();
    assert_eq!(doc.len(), 3);
    assert_eq!(
        doc.element(0).unwrap().get_string(),
        "a copied string that is long enough to span"
    );

    let referenced = doc.element(1).unwrap();
    assert!(referenced.cells()[0].has_flag(flag::IS_REF));
    assert!(!referenced.cells()[0].has_flag(flag::IS_OWN));
    assert_eq!(referenced.size(), 1);
    assert_eq!(referenced.get_string(), "static");

    let owned = doc.element(2).unwrap();
    assert!(owned.cells()[0].has_flag(flag::IS_REF));
    assert!(owned.cells()[0].has_flag(flag::IS_OWN));
    assert_eq!(owned.get_string(), "owned");
}

#[test]
fn dup_members_extends_an_object() {
    init();
    let source = parse(r#"{"c":3,"d":[4]}"#);

    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Object);
    stack.add_member_uint("a", 1).unwrap();
    stack.add_dup_members(&source);
    stack.add_member_uint("e", 5).unwrap();
    stack.close_collection();

    let doc = stack.get_document();
    assert_eq!(doc.len(), 4);
    assert_eq!(doc.member("a").unwrap().get_uint(), 1);
    assert_eq!(doc.member("c").unwrap().get_uint(), 3);
    assert_eq!(doc.member("d").unwrap().element(0).unwrap().get_uint(), 4);
    assert_eq!(doc.member("e").unwrap().get_uint(), 5);

    drop(source);
    assert_eq!(doc.member("d").unwrap().element(0).unwrap().get_uint(), 4);
}

#[test]
fn dup_members_of_an_empty_object_is_a_no_op() {
    init();
    let empty = parse("{}");
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Object);
    stack.add_dup_members(&empty);
    stack.close_collection();
    assert_eq!(stack.get_document().len(), 0);
}

#[test]
fn add_reference_behaves_like_the_referent() {
    init();
    let target = parse(r#"{"deep":{"x":1}}"#);

    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Array);
    unsafe { stack.add_reference(&target) };
    stack.close_collection();
    let doc = stack.get_document();

    let through = doc.element(0).unwrap();
    assert_eq!(through.member("deep").unwrap().member("x").unwrap().get_uint(), 1);
    drop(doc);
    drop(target);
}

#[test]
#[should_panic(expected = "no array or object is under construction")]
fn add_value_without_open_collection_panics() {
    init();
    Stack::new(0).add_null();
}

#[test]
#[should_panic(expected = "member name must be added")]
fn object_value_without_name_panics() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Object);
    stack.add_null();
}

#[test]
#[should_panic(expected = "member name was already added")]
fn double_member_name_panics() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Object);
    stack.add_member_name("a").unwrap();
    let _ = stack.add_member_name("b");
}

#[test]
#[should_panic(expected = "while a collection is open")]
fn get_document_with_open_collection_panics() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Array);
    let _ = stack.get_document();
}

#[test]
#[should_panic(expected = "empty stack")]
fn get_document_from_empty_stack_panics() {
    init();
    let _ = Stack::new(0).get_document();
}

#[test]
#[should_panic(expected = "there is no open collection")]
fn close_without_open_panics() {
    init();
    Stack::new(0).close_collection();
}

#[test]
#[should_panic(expected = "member name with no value")]
fn close_with_dangling_member_name_panics() {
    init();
    let mut stack = Stack::new(0);
    stack.open_collection(JsonType::Object);
    stack.add_member_name("dangling").unwrap();
    stack.close_collection();
}

// ----------------------------------------------------------------------
// Source reader
// ----------------------------------------------------------------------

#[test]
fn source_reader_basics() {
    let mut source = Source::with_flags("  [1]", flag::STRICT);
    assert_eq!(source.flags(), flag::STRICT);
    assert_eq!(source.get_nonspace(), b'[');
    assert_eq!(source.consumed(), 3);

    source.push_char(b'[');
    assert_eq!(source.consumed(), 2);
    assert_eq!(source.get_char(), b'[');
    assert_eq!(source.get_char(), b'1');
    assert_eq!(source.get_char(), b']');
    assert_eq!(source.get_char(), 0);
    assert_eq!(source.get_char(), 0);
    assert_eq!(source.consumed(), 5);
}

#[test]
#[should_panic(expected = "not the byte just read")]
fn push_back_wrong_byte_panics() {
    let mut source = Source::with_flags("1", flag::STRICT);
    source.get_char();
    source.push_char(b'x');
}

#[test]
#[should_panic(expected = "before reading")]
fn push_back_before_reading_panics() {
    Source::with_flags("1", flag::STRICT).push_char(b'1');
}

#[test]
fn identifier_reader() {
    let mut source = Source::with_flags("length_8 rest", flag::STRICT);
    assert_eq!(source.get_identifier(), b"length_8");
    assert_eq!(source.get_nonspace(), b'r');

    let mut source = Source::with_flags("[x]", flag::STRICT);
    assert_eq!(source.get_identifier(), b"");

    // Digits are legal identifier bytes; the caller dispatches on the
    // first byte's class before asking for one.
    let mut source = Source::with_flags("8ball", flag::STRICT);
    assert_eq!(source.get_identifier(), b"8ball");

    assert_eq!(source::parse_identifier("abc1 x"), ("abc1", " x"));
    assert_eq!(source::parse_identifier("+nope"), ("", "+nope"));
}

#[test]
fn number_reader() {
    let mut source = Source::with_flags("123abc", flag::STRICT);
    assert_eq!(source.get_number().unwrap(), (&b"123"[..], true));
    assert_eq!(source.get_char(), b'a');

    let mut source = Source::with_flags("-1.5e3,", flag::STRICT);
    assert_eq!(source.get_number().unwrap(), (&b"-1.5e3"[..], false));

    let mut source = Source::with_flags("0x1F)", flag::ALLOW_HEX);
    assert_eq!(source.get_number().unwrap(), (&b"0x1F"[..], true));
    assert_eq!(source.get_char(), b')');

    let mut source = Source::with_flags("-x", flag::STRICT);
    assert_eq!(source.get_number().unwrap_err(), Error::Invalid(1));
}

// ----------------------------------------------------------------------
// Dictionary
// ----------------------------------------------------------------------

#[test]
fn dict_growth_matches_the_load_policy() {
    let mut dict: dict::Dict<u64> = dict::Dict::new(0);
    assert_eq!(dict.bucket_count(), 0);
    assert!(dict.is_empty());
    assert!(dict.find(b"ABC").is_none());

    let slot = dict.add(b"ABC");
    assert!(slot.is_none(), "a new entry has no value");
    *slot = Some(100);
    assert_eq!(dict.bucket_count(), 1);

    *dict.add(b"DE") = Some(200);
    assert_eq!(dict.bucket_count(), 2);

    // ABC and DE both rebucketed to 0, so HJKL lands in an empty bucket
    // and no further resize happens.
    *dict.add(b"HJKL") = Some(300);
    assert_eq!(dict.bucket_count(), 2);

    assert_eq!(dict.len(), 3);
    assert_eq!(dict.find(b"ABC"), Some(&100));
    assert_eq!(dict.find(b"DE"), Some(&200));
    assert_eq!(dict.find(b"HJKL"), Some(&300));
    assert!(dict.find(b"missing").is_none());
}

#[test]
fn dict_for_each_visits_and_aborts() {
    let mut dict: dict::Dict<u64> = dict::Dict::new(4);
    *dict.add(b"one") = Some(1);
    *dict.add(b"two") = Some(2);
    *dict.add(b"three") = Some(3);

    let mut total = 0;
    dict.for_each(|_key, value| {
        total += value.unwrap();
        true
    });
    assert_eq!(total, 6);

    let mut visits = 0;
    dict.for_each(|_key, _value| {
        visits += 1;
        false
    });
    assert_eq!(visits, 1);
}

// ----------------------------------------------------------------------
// Type registry
// ----------------------------------------------------------------------

#[test]
fn type_registry_names_and_queries() {
    init();
    assert!(types::is_init());
    assert_eq!(types::to_str(JsonType::Object as u16), "object");
    assert_eq!(types::to_str(0xfff0), "unregistered");
    assert_eq!(types::from_str("array"), Some(JsonType::Array as u16));
    assert_eq!(types::from_str("no such type"), None);

    assert!(types::supports_len(JsonType::String as u16));
    assert!(types::supports_len(JsonType::Object as u16));
    assert!(!types::supports_len(JsonType::Bool as u16));

    // Dynamic ids start past the built-in table.
    assert!(ident::type_id().unwrap() >= types::MIN_TYPES as u16);
}

// ----------------------------------------------------------------------
// Operators
// ----------------------------------------------------------------------

fn and_default<'a>(left: &'a Value, right: &'a Value) -> Result<OperOut<'a>> {
    Ok(OperOut::Owned(Document::boolean(left.test() && right.test())))
}

fn len_default(arg: &Value) -> Result<OperOut<'_>> {
    if !types::supports_len(arg.get_type()) {
        return Err(Error::Unsupported("len"));
    }

    Ok(OperOut::Owned(Document::uint(arg.len() as u64)))
}

fn in_string<'a>(left: &'a Value, right: &'a Value) -> Result<OperOut<'a>> {
    if left.get_type() != JsonType::String as u16 {
        return Err(Error::Unsupported("in"));
    }

    let haystack = right.get_string();

    match haystack.find(&*left.get_string()) {
        Some(at) => Ok(OperOut::Owned(Document::string_dup(&haystack[at..]))),
        None => Ok(OperOut::Owned(Document::null())),
    }
}

// Wonky override taking the length of a number's shortest rendering.
fn len_number(arg: &Value) -> Result<OperOut<'_>> {
    Ok(OperOut::Owned(Document::number(
        format!("{}", arg.get_number()).len() as f64,
    )))
}

fn pass_through(arg: &Value) -> Result<OperOut<'_>> {
    Ok(OperOut::Borrowed(arg))
}

#[test]
fn operator_registration_and_dispatch() {
    init();
    let and_op = oper::register("&&", oper::BINARY, Some(OperFn::Binary(and_default)));
    let len_op = oper::register("len", 0, Some(OperFn::Unary(len_default)));
    let in_op = oper::register("in", oper::BINARY | oper::TYPE_RIGHT, None);
    oper::add_to_type(in_op, JsonType::String as u16, OperFn::Binary(in_string));

    assert_eq!(oper::name(and_op), "&&");
    assert_eq!(oper::find("in"), Some(in_op));
    assert_eq!(oper::find("nonesuch"), None);

    let yes = Document::boolean(true);
    let no = Document::boolean(false);
    assert!(oper::apply_binary(&yes, and_op, &yes).unwrap().test());
    assert!(!oper::apply_binary(&yes, and_op, &no).unwrap().test());

    let string = Document::string_ref("this string is 33 characters long");
    assert_eq!(oper::apply_unary(len_op, &yes).unwrap_err(), Error::Unsupported("len"));
    assert_eq!(oper::apply_unary(len_op, &string).unwrap().get_uint(), 33);

    // Dispatch is on the right argument's type.
    let needle = Document::string_ref("33");
    let found = oper::apply_binary(&needle, in_op, &string).unwrap();
    assert_eq!(found.get_string(), "33 characters long");

    let number = Document::number(666.0);
    assert_eq!(
        oper::apply_binary(&needle, in_op, &number).unwrap_err(),
        Error::Unsupported("in")
    );

    // A per-type override fills in where there is no default.
    oper::add_to_type(len_op, JsonType::Number as u16, OperFn::Unary(len_number));
    assert_eq!(oper::apply_unary(len_op, &number).unwrap().get_number(), 3.0);
}

#[test]
fn operator_without_default_or_override_is_unsupported() {
    init();
    let tilde = oper::register("~", 0, None);
    let number = Document::number(1.0);
    assert_eq!(oper::apply_unary(tilde, &number).unwrap_err(), Error::Unsupported("~"));
}

#[test]
fn operator_can_return_an_argument_by_borrow() {
    init();
    let keep = oper::register("keep", 0, Some(OperFn::Unary(pass_through)));
    let doc = parse(r#"{"a":1}"#);
    let out = oper::apply_unary(keep, &doc).unwrap();
    let returned: &Value = &out;
    let argument: &Value = &doc;
    assert!(std::ptr::eq(returned, argument));
    assert!(matches!(out, OperOut::Borrowed(_)));
    assert_eq!(out.member("a").unwrap().get_uint(), 1);
}

#[test]
#[should_panic(expected = "is binary")]
fn unary_apply_of_binary_operator_panics() {
    init();
    let op = oper::register("binary-arity-check", oper::BINARY, None);
    let value = Document::null();
    let _ = oper::apply_unary(op, &value);
}

#[test]
#[should_panic(expected = "already registered")]
fn duplicate_operator_registration_panics() {
    init();
    oper::register("duplicate-check", 0, None);
    oper::register("duplicate-check", 0, None);
}

// ----------------------------------------------------------------------
// Identifier extension and constants
// ----------------------------------------------------------------------

#[test]
fn identifiers_parse_as_their_own_type() {
    init();
    let ident_type = ident::register(); // idempotent

    let doc = Document::parse_with_flags("[NONE,length_8,identifier]", flag::ALLOW_IDENTS).unwrap();
    assert_eq!(doc.len(), 3);

    let first = doc.element(0).unwrap();
    assert_eq!(first.get_type(), ident_type);
    assert_eq!(first.json_type(), None);
    assert_eq!(ident::name(first), "NONE");
    assert_eq!(first.len(), 4);
    assert_eq!(first.size(), 1);

    // The 8-byte name needs a continuation cell.
    let middle = doc.element(1).unwrap();
    assert_eq!(ident::name(middle), "length_8");
    assert_eq!(middle.len(), STRING_SIZE);
    assert_eq!(middle.size(), 2);

    let last = doc.element(2).unwrap();
    assert_eq!(ident::name(last), "identifier");
    assert_eq!(last.len(), 10);
    check_spans(&doc);
}

#[test]
fn strict_mode_rejects_identifiers() {
    init();
    assert!(matches!(
        Document::parse_with_flags("[NONE,length_8,identifier]", flag::STRICT),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn constants_substitute_for_identifiers() {
    init(); // installs constants {"NONE":0,"BIT0":1}
    let doc = Document::parse_with_flags(
        "[NONE,BIT0,identifier]",
        flag::ALLOW_CONSTS | flag::ALLOW_IDENTS,
    )
    .unwrap();

    let first = doc.element(0).unwrap();
    assert_eq!(first.json_type(), Some(JsonType::Number));
    assert_eq!(first.get_uint(), 0);
    assert_eq!(doc.element(1).unwrap().get_uint(), 1);

    let third = doc.element(2).unwrap();
    assert_eq!(Some(third.get_type()), ident::type_id());
    assert_eq!(ident::name(third), "identifier");
}

#[test]
fn extensions_raise_the_default_flags() {
    init();
    assert_ne!(default_flags() & flag::ALLOW_IDENTS, 0);
    assert_ne!(default_flags() & flag::ALLOW_CONSTS, 0);

    // Document::parse picks the defaults up.
    let doc = Document::parse("[NONE]").unwrap();
    assert_eq!(doc.element(0).unwrap().get_uint(), 0);
}

// ----------------------------------------------------------------------
// Thread memory tracking
// ----------------------------------------------------------------------

struct Probe(Arc<AtomicUsize>);

impl Drop for Probe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// The only test that reaps, so concurrent tests can't race it into
// observing a half-finished reclaim.
#[test]
fn thread_memory_reaping() {
    init();
    let worker_drops = Arc::new(AtomicUsize::new(0));
    let my_drops = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&worker_drops);
    std::thread::spawn(move || {
        thread_memory::track(Probe(counter));
    })
    .join()
    .unwrap();

    let _mine = thread_memory::track(Probe(Arc::clone(&my_drops)));

    thread_memory::reap(thread_memory::Reap::Unused);
    assert_eq!(worker_drops.load(Ordering::SeqCst), 1, "dead thread's memory reclaimed");
    assert_eq!(my_drops.load(Ordering::SeqCst), 0, "live caller's memory kept");

    thread_memory::reap(thread_memory::Reap::All);
    assert_eq!(my_drops.load(Ordering::SeqCst), 1, "All reclaims the caller's too");
}

#[test]
fn thread_stack_parses_repeatedly() {
    init();
    let a = parse("[1,2,3]");
    let b = parse(r#"{"k":"v"}"#); // same thread stack, reused after extraction
    assert_eq!(a.len(), 3);
    assert_eq!(b.member("k").unwrap().get_string(), "v");
}
