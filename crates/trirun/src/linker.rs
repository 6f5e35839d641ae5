//! Host import installation for the gateway guest ABI.
//!
//! The guest world imports two capability interfaces and the host links them
//! dynamically by introspecting the component type, so no bindgen is needed:
//!
//! - `gateway:protocols/modbus-source` / `receive-frame` pops the staged frame
//! - `gateway:protocols/mqtt-sink` / `publish` captures into the outbox
//!
//! Imports the component does not declare are simply not installed; a
//! component with no gateway imports still instantiates.

use anyhow::anyhow;
use wasmtime::StoreContextMut;
use wasmtime::component::Component;
use wasmtime::component::Linker;
use wasmtime::component::Val;
use wasmtime::component::types::ComponentItem;

use crate::context::GatewayCtx;
use crate::sink::Publication;
use crate::sink::Qos;

pub(crate) const SOURCE_INTERFACE: &str = "gateway:protocols/modbus-source";
pub(crate) const SINK_INTERFACE: &str = "gateway:protocols/mqtt-sink";
pub(crate) const METRICS_INTERFACE: &str = "gateway:protocols/metrics";
pub(crate) const RECEIVE_FRAME: &str = "receive-frame";
pub(crate) const PUBLISH: &str = "publish";
pub(crate) const GET_STATS: &str = "get-stats";
pub(crate) const RUN: &str = "run";

/// Installs the gateway capabilities for every import the component declares.
pub(crate) fn install_gateway_imports(
    linker: &mut Linker<GatewayCtx>,
    component: &Component,
) -> anyhow::Result<()> {
    let engine = linker.engine().clone();
    for (name, item) in component.component_type().imports(&engine) {
        let ComponentItem::ComponentInstance(_) = item else {
            continue;
        };
        match name {
            SOURCE_INTERFACE => install_source(linker)?,
            SINK_INTERFACE => install_sink(linker)?,
            other => {
                tracing::debug!(import = other, "leaving unrecognized import unlinked");
            }
        }
    }
    Ok(())
}

fn install_source(linker: &mut Linker<GatewayCtx>) -> anyhow::Result<()> {
    let mut instance = linker.instance(SOURCE_INTERFACE)?;
    instance.func_new_async(RECEIVE_FRAME, |mut store: StoreContextMut<'_, GatewayCtx>, _func_ty, _args, results| {
        Box::new(async move {
            let reply = match store.data_mut().take_frame() {
                Some(frame) => Ok(Some(Box::new(Val::List(
                    frame.into_iter().map(Val::U8).collect(),
                )))),
                None => Err(Some(Box::new(error_code_val(1, "frame source exhausted")))),
            };
            write_result(results, Val::Result(reply))
        })
    })?;
    Ok(())
}

fn install_sink(linker: &mut Linker<GatewayCtx>) -> anyhow::Result<()> {
    let mut instance = linker.instance(SINK_INTERFACE)?;
    instance.func_new_async(PUBLISH, |mut store: StoreContextMut<'_, GatewayCtx>, _func_ty, args, results| {
        Box::new(async move {
            let publication = decode_publish_args(args)?;
            store.data_mut().capture(publication);
            write_result(results, Val::Result(Ok(None)))
        })
    })?;
    Ok(())
}

fn write_result(results: &mut [Val], val: Val) -> anyhow::Result<()> {
    match results.first_mut() {
        Some(slot) => {
            *slot = val;
            Ok(())
        }
        // A result-less signature; nothing to write.
        None => Ok(()),
    }
}

fn decode_publish_args(args: &[Val]) -> anyhow::Result<Publication> {
    let [topic, payload, qos] = args else {
        return Err(anyhow!("publish expects (topic, payload, qos)"));
    };

    let topic = match topic {
        Val::String(s) => s.clone(),
        other => return Err(anyhow!("publish topic must be a string, got {:?}", other)),
    };

    // The original guest publishes JSON text; accept raw byte lists too.
    let payload = match payload {
        Val::String(s) => s.as_bytes().to_vec(),
        Val::List(items) => items
            .iter()
            .map(|item| match item {
                Val::U8(byte) => Ok(*byte),
                other => Err(anyhow!("publish payload list must be u8, got {:?}", other)),
            })
            .collect::<anyhow::Result<Vec<u8>>>()?,
        other => {
            return Err(anyhow!(
                "publish payload must be string or list<u8>, got {:?}",
                other
            ));
        }
    };

    let qos = match qos {
        Val::U8(byte) => {
            Qos::from_u8(*byte).ok_or_else(|| anyhow!("invalid qos level {}", byte))?
        }
        other => return Err(anyhow!("publish qos must be u8, got {:?}", other)),
    };

    Ok(Publication {
        topic,
        payload,
        qos,
    })
}

fn error_code_val(code: u32, message: &str) -> Val {
    Val::Record(vec![
        ("code".to_string(), Val::U32(code)),
        ("message".to_string(), Val::String(message.to_string())),
    ])
}
