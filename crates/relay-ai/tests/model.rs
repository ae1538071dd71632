use std::sync::Arc;

use relay_ai::{ConsultRequest, ModelCollaborator, ModelFuture, ModelRef, RelayError, Turn};

#[tokio::test]
async fn closures_act_as_model_collaborators() {
    let model: ModelRef = Arc::new(|request: ConsultRequest| -> ModelFuture {
        Box::pin(async move {
            let last = request
                .turns
                .last()
                .map(|turn| turn.text().to_string())
                .unwrap_or_default();
            Ok::<Turn, RelayError>(Turn::assistant(format!("echo: {last}")))
        })
    });

    let reply = model
        .consult(ConsultRequest::new(vec![Turn::user("hi")]))
        .await
        .expect("closure model should answer");
    assert_eq!(reply.text(), "echo: hi");
}
