mod common;

use common::{ScriptedAgent, Step, TestGateway, kinds, request, weather};
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use parley_core::{FragmentKind, MessageFragment, REJECTION_MESSAGE};

#[tokio::test]
async fn test_health() {
    let gateway = TestGateway::spawn(ScriptedAgent::new(vec![])).await;
    let body: Value = reqwest::get(gateway.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pendingApprovals"], 0);
    assert_eq!(body["pendingElicitations"], 0);
    assert_eq!(body["groups"], 0);

    let _ticket = gateway
        .session
        .gate()
        .register("weather", "get", serde_json::Map::new());
    let _subscription = gateway.session.broadcast().subscribe("lobby");
    let body: Value = reqwest::get(gateway.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["pendingApprovals"], 1);
    assert_eq!(body["groups"], 1);
}

#[tokio::test]
async fn test_resolving_unknown_call_is_404() {
    let gateway = TestGateway::spawn(ScriptedAgent::new(vec![])).await;
    let client = reqwest::Client::new();

    for action in ["approve", "reject"] {
        let response = client
            .post(gateway.url(&format!("/api/approvals/{action}/nonexistent")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn test_approved_call_over_http() {
    let agent = ScriptedAgent::new(vec![
        Step::Call("get", json!({"city": "Paris"})),
        Step::Text(" Enjoy!"),
    ]);
    let results = agent.results.clone();
    let gateway = TestGateway::spawn(agent).await;
    let client = reqwest::Client::new();

    let stream = gateway
        .session
        .stream(request("weather in Paris?", vec![weather()]), &CancellationToken::new());
    let collector = tokio::spawn(stream.collect::<Vec<MessageFragment>>());

    let id = gateway.next_pending().await;
    let pending: Vec<Value> = client
        .get(gateway.url("/api/approvals/pending"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], id);
    assert_eq!(pending[0]["pluginName"], "weather");
    assert_eq!(pending[0]["functionName"], "get");
    assert_eq!(pending[0]["args"]["city"], "Paris");

    let approve = gateway.url(&format!("/api/approvals/approve/{id}"));
    assert_eq!(client.post(&approve).send().await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        client.post(&approve).send().await.unwrap().status(),
        StatusCode::NOT_FOUND
    );

    let fragments = collector.await.unwrap();
    assert_eq!(
        kinds(&fragments),
        [
            "chat",
            "function-request",
            "function-approved",
            "function-result",
            "chat",
            "chat"
        ]
    );
    assert_eq!(fragments[0].message, "weather in Paris?");
    assert_eq!(
        fragments[1].pending_function_call.as_ref().unwrap().id,
        id
    );
    assert_eq!(results.lock().unwrap().as_slice(), ["sunny in Paris"]);
    assert_eq!(
        fragments.last().unwrap().message,
        " (sunny in Paris) Enjoy!"
    );
}

#[tokio::test]
async fn test_rejected_call_over_http() {
    let agent = ScriptedAgent::new(vec![Step::Call("get", json!({"city": "Paris"}))]);
    let results = agent.results.clone();
    let gateway = TestGateway::spawn(agent).await;
    let client = reqwest::Client::new();

    let stream = gateway
        .session
        .stream(request("weather?", vec![weather()]), &CancellationToken::new());
    let collector = tokio::spawn(stream.collect::<Vec<MessageFragment>>());

    let id = gateway.next_pending().await;
    let response = client
        .post(gateway.url(&format!("/api/approvals/reject/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let fragments = collector.await.unwrap();
    assert_eq!(fragments[2].kind, FragmentKind::FunctionRejected);
    assert!(!fragments.iter().any(|f| f.kind == FragmentKind::FunctionResult));
    assert_eq!(results.lock().unwrap().as_slice(), [REJECTION_MESSAGE]);
}

#[tokio::test]
async fn test_unknown_call_leaves_real_call_pending() {
    let gateway = TestGateway::spawn(ScriptedAgent::new(vec![Step::Call(
        "get",
        json!({"city": "Oslo"}),
    )]))
    .await;
    let client = reqwest::Client::new();
    let _stream = gateway
        .session
        .stream(request("weather?", vec![weather()]), &CancellationToken::new());

    let id = gateway.next_pending().await;
    let response = client
        .post(gateway.url("/api/approvals/approve/nonexistent"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(gateway.session.gate().get(&id).is_some());
}

#[tokio::test]
async fn test_elicitation_round_trip() {
    let agent = ScriptedAgent::new(vec![Step::Call("confirm", json!({}))]);
    let results = agent.results.clone();
    let gateway = TestGateway::spawn(agent).await;
    let client = reqwest::Client::new();

    let mut stream = gateway
        .session
        .stream(request("go", vec![weather()]), &CancellationToken::new());

    let id = gateway.next_pending().await;
    client
        .post(gateway.url(&format!("/api/approvals/approve/{id}")))
        .send()
        .await
        .unwrap();

    let elicitation = loop {
        let fragment = stream.next().await.unwrap();
        if fragment.kind == FragmentKind::ToolDirectoryRequest {
            break fragment.tool_update.unwrap().elicitation.unwrap();
        }
    };
    assert_eq!(elicitation.message, "Really?");
    assert!(elicitation.fields.contains_key("ok"));

    let response = client
        .post(gateway.url(&format!("/api/elicitations/{}", elicitation.id)))
        .json(&json!({"action": "accept", "content": {"ok": true}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let rest: Vec<MessageFragment> = stream.collect().await;
    assert!(rest.iter().any(|f| f.kind == FragmentKind::FunctionResult));
    assert_eq!(results.lock().unwrap().as_slice(), ["confirmed"]);

    let again = client
        .post(gateway.url(&format!("/api/elicitations/{}", elicitation.id)))
        .json(&json!({"action": "decline"}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_group_publish() {
    let gateway = TestGateway::spawn(ScriptedAgent::new(vec![])).await;
    let client = reqwest::Client::new();
    let mut subscription = gateway.session.broadcast().subscribe("lobby");

    let response = client
        .post(gateway.url("/api/groups/lobby/publish"))
        .json(&json!({"BubbleId": "b1", "User": "bob", "Message": "hi", "Type": "chat"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["delivered"], 1);

    let fragment = subscription.recv().await.unwrap();
    assert_eq!(fragment.bubble_id, "b1");
    assert_eq!(fragment.user, "bob");

    let response = client
        .post(gateway.url("/api/groups/nobody/publish"))
        .json(&json!({"bubbleId": "b2", "user": "bob", "message": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(!gateway.session.broadcast().contains("nobody"));

    let response = client
        .post(gateway.url("/api/groups/lobby/publish"))
        .json(&json!({"user": "bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(gateway.url("/api/groups/lobby/publish"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
