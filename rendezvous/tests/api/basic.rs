use crate::helper::TestApp;

#[actix_web::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = awc::Client::new()
        .get(app.http_url("health_check"))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
}
