use serde_json::Value;

fn schema_properties<'a>(doc: &'a Value, name: &str) -> &'a serde_json::Map<String, Value> {
    doc.get("components")
        .and_then(|c| c.get("schemas"))
        .and_then(|s| s.get(name))
        .and_then(|t| t.get("properties"))
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("components.schemas.{}.properties must exist", name))
}

#[test]
fn openapi_has_session_and_claim_fields() -> anyhow::Result<()> {
    // Build the OpenAPI document the same way the server does
    let doc = fire_safety_auth::docs::build_openapi(8000);
    let v = serde_json::to_value(&doc)?;

    let login = schema_properties(&v, "LoginResponse");
    for k in ["accessToken", "refreshToken", "user", "factory"] {
        assert!(login.contains_key(k), "OpenAPI LoginResponse schema missing '{}'", k);
    }

    let claims = schema_properties(&v, "TokenClaims");
    for k in ["userId", "role", "factoryId", "permissions", "type", "jti", "exp", "iss", "aud"] {
        assert!(claims.contains_key(k), "OpenAPI TokenClaims schema missing '{}'", k);
    }

    let effective = schema_properties(&v, "EffectivePermissions");
    for k in ["userId", "roles", "allPermissions"] {
        assert!(effective.contains_key(k), "OpenAPI EffectivePermissions schema missing '{}'", k);
    }

    Ok(())
}

#[test]
fn openapi_documents_bearer_auth_and_server() -> anyhow::Result<()> {
    let doc = fire_safety_auth::docs::build_openapi(9100);
    let v = serde_json::to_value(&doc)?;

    assert_eq!(v["components"]["securitySchemes"]["bearerAuth"]["type"], "http");
    assert_eq!(v["components"]["securitySchemes"]["bearerAuth"]["bearerFormat"], "JWT");
    assert_eq!(v["servers"][0]["url"], "http://localhost:9100");

    Ok(())
}
