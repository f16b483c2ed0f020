use eip_core::exchange::Exchange;
use eip_core::processor::Processor;
use eip_macros::processor;

#[processor]
async fn add_audit_header(exchange: &mut Exchange) -> anyhow::Result<()> {
    exchange.set_header("audited", true);
    Ok(())
}

#[processor(name = Uppercase)]
fn upper_body(exchange: &mut Exchange) -> anyhow::Result<()> {
    let body = exchange.message().body_as_string().to_uppercase();
    exchange.set_body(body);
    Ok(())
}

fn main() {
    // 生成的结构体实现 Processor，可作为共享处理器使用
    let _shared = AddAuditHeader::shared();
    let _direct: &dyn Processor = &Uppercase;

    // 原函数保留
    let _f = upper_body;
}
