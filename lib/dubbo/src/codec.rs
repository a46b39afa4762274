//! Composition of request bodies and parsing of response bodies. The frame
//! header is handled by `frame`; everything inside the body is Hessian.

use crate::error::{DubboError, DubboResult};
use crate::frame;
use bytes::BytesMut;
use hessian2::{Decoder, Encoder, Value};

/// One remote invocation, before it is bound to an invocation id.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Protocol version advertised to the provider, e.g. `2.4.10`.
    pub dubbo_version: String,
    /// The service interface, e.g. `com.example.EchoProvider`.
    pub path: String,
    /// The service version, e.g. `1.0.0`.
    pub version: String,
    pub method: String,
    pub arguments: Vec<Value>,
}

/// Builds the JVM-style descriptor string for the positional arguments, the
/// concatenation of one descriptor per argument.
pub fn parameter_types(arguments: &[Value]) -> DubboResult<String> {
    let mut types = String::new();
    for argument in arguments {
        descriptor(argument, &mut types)?;
    }
    Ok(types)
}

fn descriptor(value: &Value, out: &mut String) -> DubboResult<()> {
    match value {
        Value::Bool(_) => out.push('Z'),
        Value::Int(_) => out.push('I'),
        Value::Long(_) => out.push('J'),
        Value::Double(_) => out.push('D'),
        Value::String(_) => out.push_str("Ljava/lang/String;"),
        Value::Object(object) => {
            out.push('L');
            out.push_str(&object.path.replace('.', "/"));
            out.push(';');
        }
        Value::List(list) => {
            let element = list.elements.first().ok_or_else(|| {
                DubboError::Hessian("empty list has no element type".to_string())
            })?;
            out.push('[');
            descriptor(element, out)?;
        }
        Value::Null => {
            return Err(DubboError::Hessian(
                "cannot infer null's type".to_string(),
            ))
        }
        other => {
            return Err(DubboError::Hessian(format!(
                "{} arguments have no descriptor",
                other.kind()
            )))
        }
    }
    Ok(())
}

/// Encodes a complete request frame: header plus the flat body of
/// `dubbo_version, path, version, method, parameter descriptor, arguments…,
/// attachments`.
pub fn encode_request(invoke_id: i64, request: &RpcRequest) -> DubboResult<BytesMut> {
    let types = parameter_types(&request.arguments)?;

    let mut encoder = Encoder::new();
    encoder.write_string(&request.dubbo_version);
    encoder.write_string(&request.path);
    encoder.write_string(&request.version);
    encoder.write_string(&request.method);
    encoder.write_string(&types);
    for argument in &request.arguments {
        encoder.write_value(argument);
    }

    let attachments = Value::map(vec![
        (Value::from("path"), Value::from(request.path.as_str())),
        (Value::from("interface"), Value::from(request.path.as_str())),
        (Value::from("version"), Value::from(request.version.as_str())),
    ]);
    encoder.write_value(&attachments);

    let body = encoder.into_bytes();
    Ok(frame::encode_request(invoke_id, &body))
}

/// Parses a status-20 response body: a flag int, then the payload the flag
/// calls for.
pub fn decode_response(body: &[u8]) -> DubboResult<Value> {
    let mut decoder = Decoder::new(body);
    let flag = decoder.read_int()?;
    match flag {
        2 => Ok(Value::Null),
        1 => Ok(decoder.read_value()?),
        0 => Err(DubboError::RemoteApplication(render_exception(
            decoder.read_value()?,
        ))),
        other => Err(DubboError::Hessian(format!(
            "unknown response flag {}, expected 0, 1 or 2",
            other
        ))),
    }
}

/// Parses the body of a response whose header status was not OK: one string
/// describing the failure.
pub fn decode_error_body(status: u8, body: &[u8]) -> DubboError {
    let message = Decoder::new(body)
        .read_string()
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    DubboError::RemoteResponse { status, message }
}

/// Renders a decoded server exception into the multi-line form
/// `cause: detailMessage` followed by one `\tat …` line per stack frame.
fn render_exception(exception: Value) -> String {
    let object = match exception {
        Value::Object(object) => object,
        other => return format!("{:?}", other),
    };

    let detail = object
        .get("detailMessage")
        .and_then(Value::as_str)
        .unwrap_or("");
    let mut message = format!("\n{}: {}\n", object.path, detail);

    if let Some(Value::List(trace)) = object.get("stackTrace") {
        for element in &trace.elements {
            let frame = match element.as_object() {
                Some(frame) => frame,
                None => continue,
            };
            let part = |name: &str| {
                frame
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            };
            let line = frame
                .get("lineNumber")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            message.push_str(&format!(
                "\tat {}.{}({}:{})\n",
                part("declaringClass"),
                part("methodName"),
                part("fileName"),
                line
            ));
        }
    }
    message
}
