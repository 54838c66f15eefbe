//! # Dynamic Protobuf Codec
//!
//! Schema-driven conversion between JSON values and protobuf messages, and a
//! tonic `Codec` that moves `DynamicMessage`s over the wire. Both ends are
//! driven by descriptors loaded at startup, so no generated code is needed
//! per backend service.
//!
//! JSON follows the grpc-gateway defaults: unknown input fields are discarded,
//! proto and lowerCamelCase field names are both accepted on input, and output
//! uses lowerCamelCase with unpopulated fields included.

use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use serde_json::Value;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Build a protobuf message of the given type from a JSON value
pub fn json_to_message(descriptor: &MessageDescriptor, value: Value) -> Result<DynamicMessage, Status> {
    let options = DeserializeOptions::new().deny_unknown_fields(false);
    DynamicMessage::deserialize_with_options(descriptor.clone(), value, &options).map_err(|e| {
        Status::invalid_argument(format!(
            "request does not match {}: {}",
            descriptor.full_name(),
            e
        ))
    })
}

/// Render a protobuf message as JSON
pub fn message_to_json(message: &DynamicMessage) -> Result<Value, Status> {
    let options = SerializeOptions::new().skip_default_fields(false);
    message
        .serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(|e| Status::internal(format!("failed to render reply as JSON: {}", e)))
}

/// tonic codec for messages whose types are only known at runtime
#[derive(Debug, Clone)]
pub struct DynamicCodec {
    response: MessageDescriptor,
}

impl DynamicCodec {
    /// `response` is the descriptor replies are decoded with
    pub fn new(response: MessageDescriptor) -> Self {
        Self { response }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.response.clone(),
        }
    }
}

#[derive(Debug)]
pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode request: {}", e)))
    }
}

#[derive(Debug)]
pub struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.descriptor.clone(), src)
            .map(Some)
            .map_err(|e| Status::internal(format!("failed to decode reply: {}", e)))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use prost_reflect::DescriptorPool;
    use prost_types::field_descriptor_proto::{Label, Type};
    use prost_types::{
        DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
        MethodDescriptorProto, ServiceDescriptorProto,
    };

    fn field(name: &str, json_name: &str, number: i32, kind: Type) -> FieldDescriptorProto {
        FieldDescriptorProto {
            name: Some(name.to_string()),
            json_name: Some(json_name.to_string()),
            number: Some(number),
            label: Some(Label::Optional as i32),
            r#type: Some(kind as i32),
            ..Default::default()
        }
    }

    fn method(name: &str, client_streaming: bool, server_streaming: bool) -> MethodDescriptorProto {
        MethodDescriptorProto {
            name: Some(name.to_string()),
            input_type: Some(".echo.v1.EchoRequest".to_string()),
            output_type: Some(".echo.v1.EchoReply".to_string()),
            client_streaming: Some(client_streaming),
            server_streaming: Some(server_streaming),
            ..Default::default()
        }
    }

    /// `echo.v1.Echo` with one method per call shape
    pub fn echo_descriptor_set() -> FileDescriptorSet {
        let file = FileDescriptorProto {
            name: Some("echo/v1/echo.proto".to_string()),
            package: Some("echo.v1".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![
                DescriptorProto {
                    name: Some("EchoRequest".to_string()),
                    field: vec![
                        field("message", "message", 1, Type::String),
                        field("repeat_count", "repeatCount", 2, Type::Int32),
                    ],
                    ..Default::default()
                },
                DescriptorProto {
                    name: Some("EchoReply".to_string()),
                    field: vec![
                        field("message", "message", 1, Type::String),
                        field("sequence", "sequence", 2, Type::Int32),
                    ],
                    ..Default::default()
                },
            ],
            service: vec![ServiceDescriptorProto {
                name: Some("Echo".to_string()),
                method: vec![
                    method("Say", false, false),
                    method("Watch", false, true),
                    method("Collect", true, false),
                    method("Chat", true, true),
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        FileDescriptorSet { file: vec![file] }
    }

    pub fn echo_pool() -> DescriptorPool {
        let mut pool = DescriptorPool::new();
        pool.add_file_descriptor_set(echo_descriptor_set()).unwrap();
        pool
    }
}
