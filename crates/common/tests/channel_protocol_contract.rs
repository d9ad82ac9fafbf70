use draftsync_common::protocol::channel::{
    ClientFrame, PresenceMember, ServerFrame, Whisper, CHANNEL_PROTOCOL_VERSION,
};
use uuid::Uuid;

fn load_contract() -> serde_json::Value {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../contracts/channel-protocol.json");
    let content = std::fs::read_to_string(path).expect("contract file should be readable");
    serde_json::from_str(&content).expect("contract file should be valid JSON")
}

fn member() -> PresenceMember {
    PresenceMember { id: Uuid::new_v4(), name: "Ada".to_string() }
}

fn frame_type(value: &serde_json::Value) -> String {
    value["type"].as_str().expect("frame should carry a type tag").to_string()
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .expect("contract entry should be an array")
        .iter()
        .map(|v| v.as_str().expect("entry should be a string").to_string())
        .collect()
}

#[test]
fn protocol_version_matches_contract() {
    let contract = load_contract();
    assert_eq!(contract["protocol"].as_str(), Some(CHANNEL_PROTOCOL_VERSION));
}

#[test]
fn server_frame_tags_match_contract() {
    let contract = load_contract();
    let expected = string_list(&contract["server_frames"]);
    let frames = [
        ServerFrame::Here { document_id: Uuid::new_v4(), members: vec![member()] },
        ServerFrame::Joining { member: member() },
        ServerFrame::Leaving { member: member() },
        ServerFrame::Whisper { whisper: Whisper::update(&[1], &member()) },
        ServerFrame::Error {
            code: "AUTH_FORBIDDEN".to_string(),
            message: "no access".to_string(),
            retryable: false,
        },
    ];
    let actual: Vec<String> = frames
        .iter()
        .map(|frame| frame_type(&serde_json::to_value(frame).expect("serialize frame")))
        .collect();
    assert_eq!(actual, expected);
}

#[test]
fn client_frame_tags_match_contract() {
    let contract = load_contract();
    let expected = string_list(&contract["client_frames"]);
    let frame = ClientFrame::Whisper { whisper: Whisper::update(&[1], &member()) };
    let actual = frame_type(&serde_json::to_value(&frame).expect("serialize frame"));
    assert_eq!(vec![actual], expected);
}

#[test]
fn whisper_fields_match_contract() {
    let contract = load_contract();
    let kinds = contract["whisper_kinds"].as_object().expect("whisper_kinds should be an object");
    let samples = [Whisper::update(&[1, 2], &member()), Whisper::restore(&[3], 2, &member())];

    assert_eq!(kinds.len(), samples.len());
    for whisper in samples {
        let value = serde_json::to_value(&whisper).expect("serialize whisper");
        let fields = string_list(&kinds[whisper.kind()]);
        for field in &fields {
            assert!(value.get(field).is_some(), "{} whisper is missing `{field}`", whisper.kind());
        }
        let object = value.as_object().expect("whisper should be an object");
        // `kind` tag plus the listed fields, nothing else.
        assert_eq!(object.len(), fields.len() + 1);
    }
}
