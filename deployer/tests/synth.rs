use arbitrum_node_deployer::{
    config::DeploymentConfig,
    stack::{assemble, NetworkRef},
    template::{reference, Format, Template},
};
use serde_json::json;
use std::collections::HashMap;

fn environment(vpc_id: Option<&str>) -> HashMap<&'static str, String> {
    let mut env = HashMap::from([
        ("CLOUDFLARE_KEY", "k".to_string()),
        ("BASICAUTH_USERNAME", "admin".to_string()),
        ("BASICAUTH_HASHED_PASSWORD", "h123".to_string()),
        ("L1_NODE_URL", "https://l1.example".to_string()),
    ]);
    if let Some(id) = vpc_id {
        env.insert("VPC_ID", id.to_string());
    }
    env
}

fn synthesize(vpc_id: Option<&str>) -> Template {
    let env = environment(vpc_id);
    let config = DeploymentConfig::resolve(|name| env.get(name).cloned()).unwrap();
    assemble(&config, &NetworkRef::from_config(&config))
        .unwrap()
        .synthesize()
}

fn count(template: &Template, kind: &str) -> usize {
    template.resources_of_type(kind).count()
}

#[test]
fn test_new_network_template() {
    let template = synthesize(None);

    assert_eq!(count(&template, "AWS::EC2::VPC"), 1);
    assert_eq!(count(&template, "AWS::EC2::Subnet"), 2);
    assert_eq!(count(&template, "AWS::EC2::InternetGateway"), 1);
    assert_eq!(count(&template, "AWS::ECS::Cluster"), 1);
    assert_eq!(count(&template, "AWS::AutoScaling::AutoScalingGroup"), 1);
    assert_eq!(count(&template, "AWS::ECS::CapacityProvider"), 1);
    assert_eq!(count(&template, "AWS::ECS::ClusterCapacityProviderAssociations"), 1);
    assert_eq!(count(&template, "AWS::Logs::LogGroup"), 1);
    assert_eq!(count(&template, "AWS::ECS::TaskDefinition"), 1);
    assert_eq!(count(&template, "AWS::ECS::Service"), 1);
    assert!(!template.parameters.contains_key("PublicSubnetIds"));

    let cidrs: Vec<_> = template
        .resources_of_type("AWS::EC2::Subnet")
        .map(|id| template.resources[id].properties["CidrBlock"].clone())
        .collect();
    assert_eq!(cidrs, [json!("10.0.0.0/23"), json!("10.0.2.0/23")]);

    let asg = &template.resources["ArbitrumNodeAsg"];
    assert_eq!(
        asg.property("/VPCZoneIdentifier"),
        Some(&json!([
            reference("VpcPublicSubnet1Subnet"),
            reference("VpcPublicSubnet2Subnet")
        ]))
    );
    let launch = &template.resources["ArbitrumNodeAsgLaunchTemplate"];
    assert_eq!(
        launch.property("/LaunchTemplateData/InstanceType"),
        Some(&json!("i3en.xlarge"))
    );
}

#[test]
fn test_existing_network_template() {
    let template = synthesize(Some("vpc-0abc"));

    assert_eq!(count(&template, "AWS::EC2::VPC"), 0);
    assert_eq!(count(&template, "AWS::EC2::Subnet"), 0);
    assert!(template.parameters.contains_key("PublicSubnetIds"));

    let sg = &template.resources["ArbitrumNodeAsgInstanceSecurityGroup"];
    assert_eq!(sg.property("/VpcId"), Some(&json!("vpc-0abc")));
    let asg = &template.resources["ArbitrumNodeAsg"];
    assert_eq!(
        asg.property("/VPCZoneIdentifier"),
        Some(&reference("PublicSubnetIds"))
    );
}

#[test]
fn test_containers_in_template() {
    let template = synthesize(None);
    let task = &template.resources["ArbitrumNodeTaskDefinition"];
    assert_eq!(task.property("/NetworkMode"), Some(&json!("bridge")));
    assert_eq!(
        task.property("/Volumes"),
        Some(&json!([{ "Name": "nodedata", "Host": { "SourcePath": "/mnt/nvm/nodedata" } }]))
    );

    let containers = task.property("/ContainerDefinitions").unwrap().as_array().unwrap();
    assert_eq!(containers.len(), 2);

    let node = &containers[0];
    assert_eq!(node["Name"], "arbitrum");
    assert_eq!(node["Image"], "offchainlabs/arb-node:v1.4.0-f4bbe91");
    assert_eq!(node["MemoryReservation"], 1024);
    assert!(node["Command"]
        .as_array()
        .unwrap()
        .contains(&json!("https://l1.example")));
    assert_eq!(node["LogConfiguration"]["Options"]["mode"], "non-blocking");
    assert_eq!(node["LogConfiguration"]["Options"]["awslogs-stream-prefix"], "arbitrum");

    let proxy = &containers[1];
    assert_eq!(proxy["Name"], "caddy");
    assert_eq!(proxy["Image"], reference("CaddyImageUri"));
    assert_eq!(proxy["Links"], json!(["arbitrum:arbitrum"]));
    assert_eq!(
        proxy["Environment"],
        json!([
            { "Name": "BASICAUTH_HASHED_PASSWORD", "Value": "h123" },
            { "Name": "BASICAUTH_USERNAME", "Value": "admin" },
        ])
    );
    assert!(template.parameters.contains_key("CaddyImageUri"));
}

#[test]
fn test_task_role_policy_in_template() {
    let template = synthesize(None);
    let policy = &template.resources["ArbitrumNodeTaskDefinitionTaskRoleDefaultPolicy"];
    let statements = policy
        .property("/PolicyDocument/Statement")
        .unwrap()
        .as_array()
        .unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(
        statements[0]["Resource"],
        json!(["arn:aws:route53:::hostedzone/*", "arn:aws:route53:::change/*"])
    );
    assert_eq!(statements[1]["Resource"], json!(["*"]));
    assert_eq!(
        statements[1]["Action"],
        json!(["route53:ListHostedZonesByName", "route53:ListHostedZones"])
    );
}

#[test]
fn test_service_has_no_desired_count() {
    let template = synthesize(None);
    let service = &template.resources["ArbitrumNodeService"];
    assert!(service.property("/DesiredCount").is_none());
    assert_eq!(service.property("/Cluster"), Some(&reference("ArbitrumNodeCluster")));
    assert_eq!(
        service.property("/TaskDefinition"),
        Some(&reference("ArbitrumNodeTaskDefinition"))
    );
}

#[test]
fn test_rendering_is_stable() {
    let first = synthesize(None).render(Format::Json).unwrap();
    let second = synthesize(None).render(Format::Json).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        synthesize(Some("vpc-0abc")).render(Format::Yaml).unwrap(),
        synthesize(Some("vpc-0abc")).render(Format::Yaml).unwrap()
    );
}

#[test]
fn test_proxy_context_configures_dns_challenges() {
    let context = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../docker/caddy");
    let caddyfile = std::fs::read_to_string(context.join("Caddyfile")).unwrap();
    assert!(caddyfile.contains("acme_dns route53"));
    let dockerfile = std::fs::read_to_string(context.join("Dockerfile")).unwrap();
    assert!(dockerfile.contains("github.com/caddy-dns/route53"));
    assert!(dockerfile.contains("ENV SITE_ADDRESS="));
}
